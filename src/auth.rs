//! MySQL 인증 처리
//!
//! Native password authentication 구현 (서버 측 검증 + 테스트 클라이언트용 응답 생성)

use crate::error::{BridgeError, Result};
use crate::events::SERVER_VERSION;
use crate::protocol::{read_null_terminated_string, DEFAULT_COLLATION, SERVER_STATUS_AUTOCOMMIT};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use bytes::{BufMut, BytesMut};
use std::io::{Cursor, Read, Write};

pub const NATIVE_PASSWORD_PLUGIN: &str = "mysql_native_password";

/// Capability flags
pub mod capabilities {
    pub const LONG_PASSWORD: u32 = 1;
    pub const FOUND_ROWS: u32 = 2;
    pub const LONG_FLAG: u32 = 4;
    pub const CONNECT_WITH_DB: u32 = 8;
    pub const PROTOCOL_41: u32 = 512;
    pub const TRANSACTIONS: u32 = 8192;
    pub const SECURE_CONNECTION: u32 = 32768;
    pub const MULTI_STATEMENTS: u32 = 1 << 16;
    pub const MULTI_RESULTS: u32 = 1 << 17;
    pub const PLUGIN_AUTH: u32 = 1 << 19;
    pub const CONNECT_ATTRS: u32 = 1 << 20;
    pub const PLUGIN_AUTH_LENENC_CLIENT_DATA: u32 = 1 << 21;
}

/// 서버가 광고하는 capability
pub const SERVER_CAPABILITIES: u32 = capabilities::LONG_PASSWORD
    | capabilities::FOUND_ROWS
    | capabilities::LONG_FLAG
    | capabilities::CONNECT_WITH_DB
    | capabilities::PROTOCOL_41
    | capabilities::TRANSACTIONS
    | capabilities::SECURE_CONNECTION
    | capabilities::MULTI_STATEMENTS
    | capabilities::MULTI_RESULTS
    | capabilities::PLUGIN_AUTH
    | capabilities::CONNECT_ATTRS
    | capabilities::PLUGIN_AUTH_LENENC_CLIENT_DATA;

/// 20바이트 scramble 생성 (0과 '$' 없이 출력 가능한 문자만)
pub fn generate_scramble() -> [u8; 20] {
    let mut scramble = [0u8; 20];
    let random = [*uuid::Uuid::new_v4().as_bytes(), *uuid::Uuid::new_v4().as_bytes()].concat();
    for (dst, src) in scramble.iter_mut().zip(random) {
        *dst = 0x21 + (src % 0x5d);
        if *dst == b'$' {
            *dst = b'%';
        }
    }
    scramble
}

/// Native password 인증 응답 생성
pub fn create_auth_response(password: &str, scramble: &[u8]) -> Vec<u8> {
    if password.is_empty() {
        return Vec::new();
    }

    // SHA1(password)
    let stage1 = sha1(password.as_bytes());

    // SHA1(SHA1(password))
    let stage2 = sha1(&stage1);

    // SHA1(scramble + SHA1(SHA1(password)))
    let mut combined = scramble.to_vec();
    combined.extend_from_slice(&stage2);
    let stage3 = sha1(&combined);

    stage1.iter().zip(stage3.iter()).map(|(a, b)| a ^ b).collect()
}

/// 클라이언트 응답 검증
pub fn verify_native_password(password: &str, scramble: &[u8], response: &[u8]) -> bool {
    if password.is_empty() {
        return response.is_empty();
    }
    create_auth_response(password, scramble) == response
}

fn sha1(data: &[u8]) -> Vec<u8> {
    use sha1::{Digest, Sha1};
    let mut hasher = Sha1::new();
    hasher.update(data);
    hasher.finalize().to_vec()
}

/// Handshake v10 패킷
pub fn handshake_packet(connection_id: u32, scramble: &[u8; 20]) -> BytesMut {
    let mut out = BytesMut::new();
    out.put_u8(10);
    out.put_slice(SERVER_VERSION.as_bytes());
    out.put_u8(0);
    out.put_u32_le(connection_id);
    out.put_slice(&scramble[..8]);
    out.put_u8(0);
    out.put_u16_le(SERVER_CAPABILITIES as u16);
    out.put_u8(DEFAULT_COLLATION);
    out.put_u16_le(SERVER_STATUS_AUTOCOMMIT);
    out.put_u16_le((SERVER_CAPABILITIES >> 16) as u16);
    out.put_u8(21);
    out.put_slice(&[0u8; 10]);
    out.put_slice(&scramble[8..]);
    out.put_u8(0);
    out.put_slice(NATIVE_PASSWORD_PLUGIN.as_bytes());
    out.put_u8(0);
    out
}

/// HandshakeResponse41
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeResponse {
    pub capabilities: u32,
    pub collation: u8,
    pub username: String,
    pub auth_response: Vec<u8>,
    pub database: Option<String>,
    pub auth_plugin: Option<String>,
}

impl HandshakeResponse {
    pub fn parse(data: &[u8]) -> Result<Self> {
        let mut cursor = Cursor::new(data);
        let capabilities = cursor.read_u32::<LittleEndian>()?;
        if capabilities & capabilities::PROTOCOL_41 == 0 {
            return Err(BridgeError::Protocol("client does not support protocol 4.1".to_string()));
        }
        let _max_packet = cursor.read_u32::<LittleEndian>()?;
        let collation = cursor.read_u8()?;
        let mut reserved = [0u8; 23];
        cursor.read_exact(&mut reserved)?;
        let username = read_null_terminated_string(&mut cursor)?;

        let auth_len = if capabilities & capabilities::PLUGIN_AUTH_LENENC_CLIENT_DATA != 0 {
            crate::column::read_lcb(&mut cursor)? as usize
        } else {
            cursor.read_u8()? as usize
        };
        let mut auth_response = vec![0u8; auth_len];
        cursor.read_exact(&mut auth_response)?;

        let remaining = |cursor: &Cursor<&[u8]>| (cursor.position() as usize) < data.len();
        let database = if capabilities & capabilities::CONNECT_WITH_DB != 0 && remaining(&cursor) {
            Some(read_null_terminated_string(&mut cursor)?)
        } else {
            None
        };
        let auth_plugin = if capabilities & capabilities::PLUGIN_AUTH != 0 && remaining(&cursor) {
            Some(read_null_terminated_string(&mut cursor)?)
        } else {
            None
        };
        // 연결 속성은 무시

        Ok(HandshakeResponse {
            capabilities,
            collation,
            username,
            auth_response,
            database,
            auth_plugin,
        })
    }
}

/// 인증 패킷 생성 (테스트 클라이언트용)
pub fn create_handshake_response(
    username: &str,
    password: &str,
    database: Option<&str>,
    scramble: &[u8],
    collation: u8,
) -> std::result::Result<Vec<u8>, std::io::Error> {
    let mut buffer = Vec::new();

    let mut capabilities = capabilities::LONG_PASSWORD
        | capabilities::LONG_FLAG
        | capabilities::PROTOCOL_41
        | capabilities::SECURE_CONNECTION
        | capabilities::MULTI_STATEMENTS
        | capabilities::MULTI_RESULTS
        | capabilities::PLUGIN_AUTH;

    if database.is_some() {
        capabilities |= capabilities::CONNECT_WITH_DB;
    }

    buffer.write_u32::<LittleEndian>(capabilities)?;
    buffer.write_u32::<LittleEndian>(0)?;
    buffer.write_u8(collation)?;
    buffer.write_all(&[0u8; 23])?;

    buffer.write_all(username.as_bytes())?;
    buffer.write_u8(0)?;

    let auth_response = create_auth_response(password, scramble);
    buffer.write_u8(auth_response.len() as u8)?;
    buffer.write_all(&auth_response)?;

    if let Some(db) = database {
        buffer.write_all(db.as_bytes())?;
        buffer.write_u8(0)?;
    }

    buffer.write_all(NATIVE_PASSWORD_PLUGIN.as_bytes())?;
    buffer.write_u8(0)?;

    Ok(buffer)
}

/// Handshake v10에서 scramble 추출 (테스트 클라이언트용)
pub fn parse_handshake_scramble(data: &[u8]) -> Result<Vec<u8>> {
    let mut cursor = Cursor::new(data);
    let protocol_version = cursor.read_u8()?;
    if protocol_version != 10 {
        return Err(BridgeError::Protocol(format!("unexpected protocol version {}", protocol_version)));
    }
    read_null_terminated_string(&mut cursor)?;
    let _connection_id = cursor.read_u32::<LittleEndian>()?;
    let mut scramble = vec![0u8; 8];
    cursor.read_exact(&mut scramble)?;
    // filler, capability(2), collation, status(2), capability(2), auth len, reserved(10)
    cursor.set_position(cursor.position() + 1 + 2 + 1 + 2 + 2 + 1 + 10);
    let mut part2 = vec![0u8; 12];
    cursor.read_exact(&mut part2)?;
    scramble.extend_from_slice(&part2);
    Ok(scramble)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_auth_response_empty_password() {
        let response = create_auth_response("", &[1, 2, 3, 4]);
        assert!(response.is_empty());
        assert!(verify_native_password("", &[1, 2, 3, 4], &[]));
    }

    #[test]
    fn test_verify_native_password() {
        let scramble = generate_scramble();
        assert!(scramble.iter().all(|b| *b != 0 && *b != b'$' && b.is_ascii_graphic()));

        let response = create_auth_response("secret", &scramble);
        assert_eq!(response.len(), 20); // SHA1 produces 20 bytes
        assert!(verify_native_password("secret", &scramble, &response));
        assert!(!verify_native_password("other", &scramble, &response));
        assert!(!verify_native_password("secret", &scramble, &[]));
    }

    #[test]
    fn test_handshake_round_trip() {
        let scramble = generate_scramble();
        let greeting = handshake_packet(7, &scramble);
        assert_eq!(parse_handshake_scramble(&greeting).unwrap(), scramble.to_vec());

        let packet = create_handshake_response("root", "password", Some("testdb"), &scramble, 33).unwrap();
        let response = HandshakeResponse::parse(&packet).unwrap();
        assert_eq!(response.username, "root");
        assert_eq!(response.database.as_deref(), Some("testdb"));
        assert_eq!(response.auth_plugin.as_deref(), Some(NATIVE_PASSWORD_PLUGIN));
        assert!(verify_native_password("password", &scramble, &response.auth_response));
    }
}

//! Handshake and authentication negotiation.
//!
//! Drives the exchange from the server greeting through plugin-specific
//! credential rounds to an authenticated session, optionally upgrading the
//! transport to TLS in-band before any credentials are sent.

use crate::codec::{parse_err_payload, parse_ok_payload};
use crate::constants::{client, MAX_AUTH_ROUNDS, UTF8MB4_GENERAL_CI};
use crate::error::{Error, Result};
use crate::packet::{PacketReader, PacketWriter, Parser};
use crate::tls::{self, MaybeTlsStream, SslMode, SslOptions};
use bytes::Bytes;
use sha1::Digest;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite, ReadHalf, WriteHalf};
use tracing::debug;

/// Any bidirectional byte stream usable as the transport.
pub(crate) trait RawStream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> RawStream for T {}

/// Boxed transport handed in by the connector (TCP or unix socket).
pub(crate) type BoxedSocket = Box<dyn RawStream>;

/// The stream a session runs on after negotiation.
pub(crate) type SessionStream = MaybeTlsStream<BoxedSocket>;

/// Supported authentication plugins, one variant per wire name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthPlugin {
    /// `mysql_native_password`: SHA1 challenge-response
    MysqlNativePassword,
    /// `caching_sha2_password`: SHA256 fast path, cleartext over TLS otherwise
    CachingSha2Password,
    /// `mysql_clear_password`: cleartext, TLS required
    MysqlClearPassword,
    /// `client_ed25519`: recognized for allow-list purposes, not implementable
    Ed25519,
    /// `dialog`: PAM-style multi-round prompts
    Dialog,
}

impl AuthPlugin {
    /// Wire name of the plugin.
    pub fn name(&self) -> &'static str {
        match self {
            AuthPlugin::MysqlNativePassword => "mysql_native_password",
            AuthPlugin::CachingSha2Password => "caching_sha2_password",
            AuthPlugin::MysqlClearPassword => "mysql_clear_password",
            AuthPlugin::Ed25519 => "client_ed25519",
            AuthPlugin::Dialog => "dialog",
        }
    }

    /// Resolve a wire name; empty names default to native password.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "" | "mysql_native_password" => Some(AuthPlugin::MysqlNativePassword),
            "caching_sha2_password" => Some(AuthPlugin::CachingSha2Password),
            "mysql_clear_password" => Some(AuthPlugin::MysqlClearPassword),
            "client_ed25519" => Some(AuthPlugin::Ed25519),
            "dialog" => Some(AuthPlugin::Dialog),
            _ => None,
        }
    }
}

/// Connection-establishment inputs the negotiator needs.
#[derive(Debug, Clone, Default)]
pub(crate) struct ConnectOptions {
    pub username: String,
    pub password: Option<String>,
    pub database: Option<String>,
    pub ssl: SslOptions,
    /// Allow-list of permitted plugin names; `None` permits everything
    pub restricted_auth: Option<Vec<String>>,
    /// Answers for PAM rounds beyond the first
    pub pam_other_pwd: Vec<String>,
    pub connection_attributes: Vec<(String, String)>,
    pub allow_multi_queries: bool,
}

/// Parsed server greeting.
#[derive(Debug)]
pub(crate) struct ServerGreeting {
    pub server_version: String,
    pub connection_id: u32,
    pub capabilities: u32,
    pub seed: Vec<u8>,
    pub default_plugin: String,
}

/// Outcome of a successful negotiation.
pub(crate) struct AuthenticatedSession {
    pub reader: PacketReader<ReadHalf<SessionStream>>,
    pub writer: PacketWriter<WriteHalf<SessionStream>>,
    pub capabilities: u32,
    pub server_version: String,
    pub connection_id: u32,
}

/// Parse the protocol-version-10 greeting payload.
pub(crate) fn parse_greeting(payload: &[u8]) -> Result<ServerGreeting> {
    let mut p = Parser::new(payload);
    let protocol_version = p
        .get_u8()
        .map_err(|_| Error::Handshake("empty greeting".to_string()))?;
    if protocol_version == 0xFF {
        let mut err = Parser::new(payload);
        let _ = err.get_u8();
        return Err(parse_err_payload(&mut err));
    }
    if protocol_version != 10 {
        return Err(Error::Handshake(format!(
            "unsupported protocol version {protocol_version}"
        )));
    }
    let parse = || -> Result<ServerGreeting> {
        let mut p = Parser::new(payload);
        p.skip(1)?;
        let server_version = p.get_null_str()?.to_string();
        let connection_id = p.get_u32()?;
        let mut seed = p.get_bytes(8)?.to_vec();
        p.skip(1)?; // filler
        let cap_low = u32::from(p.get_u16()?);
        p.skip(1)?; // character set
        p.skip(2)?; // status flags
        let cap_high = u32::from(p.get_u16()?);
        let capabilities = cap_low | (cap_high << 16);
        let seed_len = p.get_u8()?;
        p.skip(10)?; // reserved
        if capabilities & client::SECURE_CONNECTION != 0 {
            let extra = (seed_len as usize).saturating_sub(9).max(12);
            seed.extend_from_slice(p.get_bytes(extra)?);
            // trailing NUL after the seed, absent on some servers
            if p.peek_u8() == Some(0) {
                p.skip(1)?;
            }
        }
        let default_plugin = if capabilities & client::PLUGIN_AUTH != 0 && p.remaining() > 0 {
            p.get_null_str().unwrap_or("").to_string()
        } else {
            String::new()
        };
        Ok(ServerGreeting {
            server_version,
            connection_id,
            capabilities,
            seed,
            default_plugin,
        })
    };
    parse().map_err(|e| match e {
        Error::Protocol(detail) => Error::Handshake(format!("malformed greeting: {detail}")),
        other => other,
    })
}

/// `SHA1(pwd) XOR SHA1(seed ++ SHA1(SHA1(pwd)))`
pub(crate) fn native_password_scramble(password: &str, seed: &[u8]) -> Vec<u8> {
    if password.is_empty() {
        return Vec::new();
    }
    let stage1: [u8; 20] = sha1::Sha1::digest(password.as_bytes()).into();
    let stage2: [u8; 20] = sha1::Sha1::digest(stage1).into();
    let mut h = sha1::Sha1::new();
    h.update(seed);
    h.update(stage2);
    let salted: [u8; 20] = h.finalize().into();
    stage1.iter().zip(salted.iter()).map(|(a, b)| a ^ b).collect()
}

/// `SHA256(pwd) XOR SHA256(SHA256(SHA256(pwd)) ++ seed)`
pub(crate) fn caching_sha2_scramble(password: &str, seed: &[u8]) -> Vec<u8> {
    if password.is_empty() {
        return Vec::new();
    }
    let stage1: [u8; 32] = sha2::Sha256::digest(password.as_bytes()).into();
    let stage2: [u8; 32] = sha2::Sha256::digest(stage1).into();
    let mut h = sha2::Sha256::new();
    h.update(stage2);
    h.update(seed);
    let salted: [u8; 32] = h.finalize().into();
    stage1.iter().zip(salted.iter()).map(|(a, b)| a ^ b).collect()
}

/// Enforce the `restricted_auth` allow-list before any credentials are
/// computed or sent for the plugin.
pub(crate) fn check_plugin_allowed(
    name: &str,
    restricted: Option<&[String]>,
) -> Result<AuthPlugin> {
    if let Some(allowed) = restricted {
        if !allowed.iter().any(|a| a == name) {
            return Err(Error::AuthRestricted(name.to_string()));
        }
    }
    AuthPlugin::from_name(name).ok_or_else(|| Error::Auth {
        plugin: name.to_string(),
        message: "unsupported authentication plugin".to_string(),
    })
}

/// Read one packet during the handshake phase, on the unsplit stream.
async fn read_phase_packet<S: AsyncRead + AsyncWrite + Unpin>(
    stream: &mut S,
    seq: &mut u8,
) -> Result<Bytes> {
    let mut reader = PacketReader::new(&mut *stream);
    reader.seq = *seq;
    let payload = reader.read_packet().await?;
    *seq = reader.seq;
    let (_, leftover) = reader.into_parts();
    if !leftover.is_empty() {
        // nothing may pipeline ahead of the handshake; this also blocks
        // plaintext injection before a TLS upgrade
        return Err(Error::Protocol(
            "unexpected trailing data during handshake".to_string(),
        ));
    }
    Ok(payload)
}

/// Send one packet during the handshake phase, on the unsplit stream.
async fn send_phase_packet<S: AsyncRead + AsyncWrite + Unpin>(
    stream: &mut S,
    seq: &mut u8,
    build: impl FnOnce(&mut PacketWriter<&mut S>),
) -> Result<()> {
    let mut writer = PacketWriter::new(&mut *stream);
    writer.seq = *seq;
    writer.begin();
    build(&mut writer);
    writer.send().await?;
    *seq = writer.seq;
    Ok(())
}

fn plugin_first_response(
    plugin: AuthPlugin,
    opts: &ConnectOptions,
    seed: &[u8],
    tls_active: bool,
) -> Result<Vec<u8>> {
    let password = opts.password.as_deref().unwrap_or("");
    match plugin {
        AuthPlugin::MysqlNativePassword => Ok(native_password_scramble(password, seed)),
        AuthPlugin::CachingSha2Password => Ok(caching_sha2_scramble(password, seed)),
        AuthPlugin::MysqlClearPassword => {
            if !tls_active {
                return Err(Error::Auth {
                    plugin: plugin.name().to_string(),
                    message: "cleartext authentication requires TLS".to_string(),
                });
            }
            let mut out = password.as_bytes().to_vec();
            out.push(0);
            Ok(out)
        }
        AuthPlugin::Dialog => Ok(Vec::new()),
        AuthPlugin::Ed25519 => Err(Error::Auth {
            plugin: plugin.name().to_string(),
            message: "client_ed25519 is not supported; configure another plugin".to_string(),
        }),
    }
}

/// Run the full negotiation over a freshly connected socket.
///
/// `sni_host` names the server for TLS verification. Session variables are
/// not sent here; the connection layer issues them right after
/// authentication.
pub(crate) async fn negotiate(
    socket: BoxedSocket,
    sni_host: &str,
    opts: &ConnectOptions,
) -> Result<AuthenticatedSession> {
    let mut stream: SessionStream = MaybeTlsStream::Plain(socket);
    let mut seq: u8 = 0;

    // AwaitGreeting
    let greeting_payload = read_phase_packet(&mut stream, &mut seq).await?;
    let greeting = parse_greeting(&greeting_payload)?;
    debug!(
        server_version = %greeting.server_version,
        connection_id = greeting.connection_id,
        "received server greeting"
    );

    if greeting.capabilities & client::PROTOCOL_41 == 0 {
        return Err(Error::Handshake(
            "server does not speak protocol 4.1".to_string(),
        ));
    }

    // Capability selection
    let mut capabilities = client::LONG_PASSWORD
        | client::LONG_FLAG
        | client::PROTOCOL_41
        | client::TRANSACTIONS
        | client::SECURE_CONNECTION
        | client::MULTI_RESULTS
        | client::PS_MULTI_RESULTS
        | client::PLUGIN_AUTH
        | client::DEPRECATE_EOF;
    if opts.database.is_some() {
        capabilities |= client::CONNECT_WITH_DB;
    }
    if opts.allow_multi_queries {
        capabilities |= client::MULTI_STATEMENTS;
    }
    if !opts.connection_attributes.is_empty() {
        capabilities |= client::CONNECT_ATTRS;
    }
    capabilities &= greeting.capabilities | client::LONG_PASSWORD;

    // SslUpgrade
    let tls_active = if opts.ssl.mode.requires_tls() {
        if greeting.capabilities & client::SSL == 0 {
            // fail before any credentials travel
            return Err(Error::Handshake(format!(
                "sslMode={:?} requires TLS but the server does not support it",
                opts.ssl.mode
            )));
        }
        capabilities |= client::SSL;
        let tls_config = Arc::new(tls::build_client_config(&opts.ssl)?);
        send_phase_packet(&mut stream, &mut seq, |w| {
            w.put_u32(capabilities);
            w.put_u32(crate::constants::MAX_PAYLOAD_LEN as u32 + 1);
            w.put_u8(UTF8MB4_GENERAL_CI);
            w.put_bytes(&[0u8; 23]);
        })
        .await?;
        stream = match stream {
            MaybeTlsStream::Plain(raw) => {
                let tls_stream = tls::wrap(raw, sni_host, tls_config).await?;
                debug!(host = sni_host, "TLS channel established");
                MaybeTlsStream::Tls(tls_stream)
            }
            wrapped => wrapped,
        };
        true
    } else {
        false
    };

    // PluginSelect + CredentialExchange
    let mut plugin = check_plugin_allowed(
        &greeting.default_plugin,
        opts.restricted_auth.as_deref(),
    )?;
    let auth_data = plugin_first_response(plugin, opts, &greeting.seed, tls_active)?;

    send_phase_packet(&mut stream, &mut seq, |w| {
        w.put_u32(capabilities);
        w.put_u32(crate::constants::MAX_PAYLOAD_LEN as u32 + 1);
        w.put_u8(UTF8MB4_GENERAL_CI);
        w.put_bytes(&[0u8; 23]);
        w.put_str_null(&opts.username);
        w.put_u8(auth_data.len() as u8);
        w.put_bytes(&auth_data);
        if capabilities & client::CONNECT_WITH_DB != 0 {
            if let Some(db) = &opts.database {
                w.put_str_null(db);
            }
        }
        w.put_str_null(plugin.name());
        if capabilities & client::CONNECT_ATTRS != 0 {
            let mut attrs = bytes::BytesMut::new();
            for (k, v) in &opts.connection_attributes {
                put_lenenc_kv(&mut attrs, k, v);
            }
            w.put_lenenc(attrs.len() as u64);
            w.put_bytes(&attrs);
        }
    })
    .await?;

    // PluginChallenge loop
    let mut pam_answers: Vec<&str> = Vec::with_capacity(1 + opts.pam_other_pwd.len());
    pam_answers.push(opts.password.as_deref().unwrap_or(""));
    pam_answers.extend(opts.pam_other_pwd.iter().map(String::as_str));
    let mut pam_round = 0usize;

    for _ in 0..MAX_AUTH_ROUNDS {
        let payload = read_phase_packet(&mut stream, &mut seq).await?;
        let mut p = Parser::new(&payload);
        match p.get_u8()? {
            0x00 => {
                parse_ok_payload(&mut p)?;
                debug!(user = %opts.username, plugin = plugin.name(), "authenticated");
                let (read_half, write_half) = tokio::io::split(stream);
                let mut reader = PacketReader::new(read_half);
                let mut writer = PacketWriter::new(write_half);
                reader.seq = seq;
                writer.seq = seq;
                return Ok(AuthenticatedSession {
                    reader,
                    writer,
                    capabilities,
                    server_version: greeting.server_version,
                    connection_id: greeting.connection_id,
                });
            }
            0xFF => {
                let server_err = parse_err_payload(&mut p);
                return Err(Error::Auth {
                    plugin: plugin.name().to_string(),
                    message: server_err.to_string(),
                });
            }
            0xFE => {
                // auth switch request
                let name = p.get_null_str()?.to_string();
                let new_seed = p.get_eof_bytes();
                let new_seed = new_seed.strip_suffix(&[0]).unwrap_or(new_seed);
                plugin = check_plugin_allowed(&name, opts.restricted_auth.as_deref())?;
                debug!(plugin = plugin.name(), "auth switch requested");
                let response = plugin_first_response(plugin, opts, new_seed, tls_active)?;
                send_phase_packet(&mut stream, &mut seq, |w| {
                    w.put_bytes(&response);
                })
                .await?;
            }
            0x01 if plugin == AuthPlugin::CachingSha2Password => {
                match p.get_u8()? {
                    0x03 => {
                        // fast auth succeeded; OK packet follows
                    }
                    0x04 => {
                        if !tls_active {
                            return Err(Error::Auth {
                                plugin: plugin.name().to_string(),
                                message: "full authentication requires TLS (public key \
                                          retrieval is not supported)"
                                    .to_string(),
                            });
                        }
                        let password = opts.password.as_deref().unwrap_or("");
                        send_phase_packet(&mut stream, &mut seq, |w| {
                            w.put_bytes(password.as_bytes());
                            w.put_u8(0);
                        })
                        .await?;
                    }
                    other => {
                        return Err(Error::Protocol(format!(
                            "unexpected caching_sha2 continuation {other:#04x}"
                        )))
                    }
                }
            }
            // PAM prompt rounds: 0x02/0x04 ask without/with echo
            0x01..=0x04 if plugin == AuthPlugin::Dialog => {
                let answer =
                    pam_answers
                        .get(pam_round)
                        .copied()
                        .ok_or_else(|| Error::Auth {
                            plugin: plugin.name().to_string(),
                            message: "server asked for more PAM answers than configured"
                                .to_string(),
                        })?;
                pam_round += 1;
                send_phase_packet(&mut stream, &mut seq, |w| {
                    w.put_str_null(answer);
                })
                .await?;
            }
            other => {
                return Err(Error::Protocol(format!(
                    "unexpected packet {other:#04x} during authentication"
                )))
            }
        }
    }

    Err(Error::Auth {
        plugin: plugin.name().to_string(),
        message: format!("authentication did not converge after {MAX_AUTH_ROUNDS} rounds"),
    })
}

fn put_lenenc_kv(buf: &mut bytes::BytesMut, k: &str, v: &str) {
    use bytes::BufMut;
    for s in [k, v] {
        let len = s.len() as u64;
        if len <= 250 {
            buf.put_u8(len as u8);
        } else {
            buf.put_u8(0xFC);
            buf.put_u16_le(len as u16);
        }
        buf.put(s.as_bytes());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_greeting(plugin: &str) -> Vec<u8> {
        let mut g = Vec::new();
        g.push(10u8);
        g.extend_from_slice(b"11.4.2-MariaDB\0");
        g.extend_from_slice(&42u32.to_le_bytes());
        g.extend_from_slice(b"abcdefgh"); // seed part 1
        g.push(0);
        let caps: u32 = client::PROTOCOL_41
            | client::SECURE_CONNECTION
            | client::PLUGIN_AUTH
            | client::SSL
            | client::DEPRECATE_EOF;
        g.extend_from_slice(&(caps as u16).to_le_bytes());
        g.push(45); // charset
        g.extend_from_slice(&2u16.to_le_bytes()); // status
        g.extend_from_slice(&((caps >> 16) as u16).to_le_bytes());
        g.push(21); // seed length
        g.extend_from_slice(&[0u8; 10]);
        g.extend_from_slice(b"ijklmnopqrst"); // seed part 2
        g.push(0);
        g.extend_from_slice(plugin.as_bytes());
        g.push(0);
        g
    }

    #[test]
    fn greeting_parses() {
        let g = parse_greeting(&sample_greeting("mysql_native_password")).unwrap();
        assert_eq!(g.server_version, "11.4.2-MariaDB");
        assert_eq!(g.connection_id, 42);
        assert_eq!(g.seed, b"abcdefghijklmnopqrst");
        assert_eq!(g.default_plugin, "mysql_native_password");
        assert!(g.capabilities & client::SSL != 0);
    }

    #[test]
    fn malformed_greeting_is_handshake_error() {
        assert!(matches!(
            parse_greeting(&[10, b'x']),
            Err(Error::Handshake(_))
        ));
        assert!(matches!(parse_greeting(&[9]), Err(Error::Handshake(_))));
    }

    #[test]
    fn native_scramble_has_sha1_property() {
        // response XOR SHA1(seed ++ SHA1(SHA1(pwd))) must equal SHA1(pwd)
        let seed = b"abcdefghijklmnopqrst";
        let out = native_password_scramble("secret", seed);
        assert_eq!(out.len(), 20);
        let stage1: [u8; 20] = sha1::Sha1::digest(b"secret").into();
        let stage2: [u8; 20] = sha1::Sha1::digest(stage1).into();
        let mut h = sha1::Sha1::new();
        h.update(seed);
        h.update(stage2);
        let salted: [u8; 20] = h.finalize().into();
        let recovered: Vec<u8> = out.iter().zip(salted.iter()).map(|(a, b)| a ^ b).collect();
        assert_eq!(recovered, stage1.to_vec());
    }

    #[test]
    fn empty_password_scrambles_are_empty() {
        assert!(native_password_scramble("", b"seed").is_empty());
        assert!(caching_sha2_scramble("", b"seed").is_empty());
    }

    #[test]
    fn caching_sha2_scramble_is_32_bytes() {
        assert_eq!(caching_sha2_scramble("pw", b"12345678901234567890").len(), 32);
    }

    #[test]
    fn allow_list_blocks_before_network_use() {
        let restricted = vec!["mysql_native_password".to_string()];
        match check_plugin_allowed("dialog", Some(&restricted)) {
            Err(Error::AuthRestricted(name)) => assert_eq!(name, "dialog"),
            other => panic!("expected AuthRestricted, got {other:?}"),
        }
        assert!(check_plugin_allowed("mysql_native_password", Some(&restricted)).is_ok());
        assert!(check_plugin_allowed("dialog", None).is_ok());
    }

    #[test]
    fn unknown_plugin_is_auth_error() {
        assert!(matches!(
            check_plugin_allowed("sha256_password_v9", None),
            Err(Error::Auth { .. })
        ));
    }
}

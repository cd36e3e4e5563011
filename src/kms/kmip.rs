//! KMIP KMS
//!
//! Speaks KMIP 1.4 TTLV over mutually-authenticated TLS. Key material is
//! registered as SecretData named by PVC; lookups go through Locate so the
//! adapter never has to persist unique identifiers itself.
//!
//! Mandatory connection details: `KMIP_ENDPOINT`, `CA_CERT`, `CLIENT_CERT`,
//! `CLIENT_KEY` (PEM contents, not paths).

use crate::error::{Error, Result};
use crate::kms::{Kms, KmsConfig, PROVIDER_KMIP};
use async_trait::async_trait;
use rustls::{Certificate, ClientConfig, PrivateKey, RootCertStore};
use std::io::Cursor;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::debug;

// =============================================================================
// TTLV Codec
// =============================================================================

/// Tag / type / length / value items, the KMIP wire primitive.
mod ttlv {
    pub const TYPE_STRUCTURE: u8 = 0x01;
    pub const TYPE_INTEGER: u8 = 0x02;
    pub const TYPE_ENUMERATION: u8 = 0x05;
    pub const TYPE_TEXT: u8 = 0x07;
    pub const TYPE_BYTES: u8 = 0x08;

    // KMIP 1.x tags used by this adapter.
    pub const TAG_ATTRIBUTE: u32 = 0x42_0008;
    pub const TAG_ATTRIBUTE_NAME: u32 = 0x42_000A;
    pub const TAG_ATTRIBUTE_VALUE: u32 = 0x42_000B;
    pub const TAG_BATCH_COUNT: u32 = 0x42_000D;
    pub const TAG_BATCH_ITEM: u32 = 0x42_000F;
    pub const TAG_KEY_BLOCK: u32 = 0x42_0040;
    pub const TAG_KEY_FORMAT_TYPE: u32 = 0x42_0042;
    pub const TAG_KEY_MATERIAL: u32 = 0x42_0043;
    pub const TAG_KEY_VALUE: u32 = 0x42_0045;
    pub const TAG_NAME_TYPE: u32 = 0x42_0054;
    pub const TAG_NAME_VALUE: u32 = 0x42_0055;
    pub const TAG_OBJECT_TYPE: u32 = 0x42_0057;
    pub const TAG_OPERATION: u32 = 0x42_005C;
    pub const TAG_PROTOCOL_VERSION: u32 = 0x42_0069;
    pub const TAG_PROTOCOL_VERSION_MAJOR: u32 = 0x42_006A;
    pub const TAG_PROTOCOL_VERSION_MINOR: u32 = 0x42_006B;
    pub const TAG_REQUEST_HEADER: u32 = 0x42_0077;
    pub const TAG_REQUEST_MESSAGE: u32 = 0x42_0078;
    pub const TAG_REQUEST_PAYLOAD: u32 = 0x42_0079;
    pub const TAG_RESULT_STATUS: u32 = 0x42_007F;
    pub const TAG_SECRET_DATA: u32 = 0x42_0085;
    pub const TAG_SECRET_DATA_TYPE: u32 = 0x42_0086;
    pub const TAG_TEMPLATE_ATTRIBUTE: u32 = 0x42_0091;
    pub const TAG_UNIQUE_IDENTIFIER: u32 = 0x42_0094;

    pub const OP_REGISTER: u32 = 0x03;
    pub const OP_LOCATE: u32 = 0x08;
    pub const OP_GET: u32 = 0x0A;
    pub const OP_DESTROY: u32 = 0x14;

    pub const OBJECT_SECRET_DATA: u32 = 0x07;
    pub const SECRET_DATA_PASSWORD: u32 = 0x01;
    pub const KEY_FORMAT_OPAQUE: u32 = 0x02;
    pub const NAME_TYPE_TEXT: u32 = 0x01;
    pub const RESULT_SUCCESS: u32 = 0x00;

    /// A decoded TTLV item.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum Value {
        Structure(Vec<Item>),
        Integer(i32),
        Enumeration(u32),
        Text(String),
        Bytes(Vec<u8>),
    }

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct Item {
        pub tag: u32,
        pub value: Value,
    }

    impl Item {
        pub fn structure(tag: u32, children: Vec<Item>) -> Self {
            Item {
                tag,
                value: Value::Structure(children),
            }
        }

        pub fn integer(tag: u32, v: i32) -> Self {
            Item {
                tag,
                value: Value::Integer(v),
            }
        }

        pub fn enumeration(tag: u32, v: u32) -> Self {
            Item {
                tag,
                value: Value::Enumeration(v),
            }
        }

        pub fn text(tag: u32, v: &str) -> Self {
            Item {
                tag,
                value: Value::Text(v.to_string()),
            }
        }

        pub fn bytes(tag: u32, v: &[u8]) -> Self {
            Item {
                tag,
                value: Value::Bytes(v.to_vec()),
            }
        }

        pub fn encode(&self, out: &mut Vec<u8>) {
            out.extend_from_slice(&self.tag.to_be_bytes()[1..4]);
            let (type_byte, payload) = match &self.value {
                Value::Structure(children) => {
                    let mut inner = Vec::new();
                    for child in children {
                        child.encode(&mut inner);
                    }
                    (TYPE_STRUCTURE, inner)
                }
                Value::Integer(v) => (TYPE_INTEGER, v.to_be_bytes().to_vec()),
                Value::Enumeration(v) => (TYPE_ENUMERATION, v.to_be_bytes().to_vec()),
                Value::Text(v) => (TYPE_TEXT, v.as_bytes().to_vec()),
                Value::Bytes(v) => (TYPE_BYTES, v.clone()),
            };
            out.push(type_byte);
            out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
            out.extend_from_slice(&payload);
            // Values pad to 8-byte boundaries; structures are always aligned.
            if !matches!(self.value, Value::Structure(_)) {
                let pad = (8 - payload.len() % 8) % 8;
                out.extend(std::iter::repeat(0u8).take(pad));
            }
        }

        pub fn to_bytes(&self) -> Vec<u8> {
            let mut out = Vec::new();
            self.encode(&mut out);
            out
        }

        /// Depth-first search for the first item with `tag`.
        pub fn find(&self, tag: u32) -> Option<&Item> {
            if self.tag == tag {
                return Some(self);
            }
            if let Value::Structure(children) = &self.value {
                for child in children {
                    if let Some(found) = child.find(tag) {
                        return Some(found);
                    }
                }
            }
            None
        }

        pub fn as_text(&self) -> Option<&str> {
            match &self.value {
                Value::Text(s) => Some(s),
                _ => None,
            }
        }

        pub fn as_bytes(&self) -> Option<&[u8]> {
            match &self.value {
                Value::Bytes(b) => Some(b),
                _ => None,
            }
        }

        pub fn as_enumeration(&self) -> Option<u32> {
            match &self.value {
                Value::Enumeration(v) => Some(*v),
                _ => None,
            }
        }
    }

    /// Decode one item from `data`, returning it and the bytes consumed.
    pub fn decode(data: &[u8]) -> Option<(Item, usize)> {
        if data.len() < 8 {
            return None;
        }
        let tag = u32::from_be_bytes([0, data[0], data[1], data[2]]);
        let type_byte = data[3];
        let len = u32::from_be_bytes([data[4], data[5], data[6], data[7]]) as usize;
        if data.len() < 8 + len {
            return None;
        }
        let payload = &data[8..8 + len];

        let value = match type_byte {
            TYPE_STRUCTURE => {
                let mut children = Vec::new();
                let mut rest = payload;
                while !rest.is_empty() {
                    let (child, used) = decode(rest)?;
                    children.push(child);
                    rest = &rest[used..];
                }
                Value::Structure(children)
            }
            TYPE_INTEGER if len == 4 => {
                Value::Integer(i32::from_be_bytes(payload.try_into().ok()?))
            }
            TYPE_ENUMERATION if len == 4 => {
                Value::Enumeration(u32::from_be_bytes(payload.try_into().ok()?))
            }
            TYPE_TEXT => Value::Text(String::from_utf8_lossy(payload).to_string()),
            TYPE_BYTES => Value::Bytes(payload.to_vec()),
            _ => return None,
        };

        let padded = if type_byte == TYPE_STRUCTURE {
            len
        } else {
            len + (8 - len % 8) % 8
        };
        Some((Item { tag, value }, 8 + padded.min(data.len() - 8)))
    }
}

use ttlv::Item;

// =============================================================================
// Request Builders
// =============================================================================

fn request_message(operation: u32, payload: Vec<Item>) -> Item {
    Item::structure(
        ttlv::TAG_REQUEST_MESSAGE,
        vec![
            Item::structure(
                ttlv::TAG_REQUEST_HEADER,
                vec![
                    Item::structure(
                        ttlv::TAG_PROTOCOL_VERSION,
                        vec![
                            Item::integer(ttlv::TAG_PROTOCOL_VERSION_MAJOR, 1),
                            Item::integer(ttlv::TAG_PROTOCOL_VERSION_MINOR, 4),
                        ],
                    ),
                    Item::integer(ttlv::TAG_BATCH_COUNT, 1),
                ],
            ),
            Item::structure(
                ttlv::TAG_BATCH_ITEM,
                vec![
                    Item::enumeration(ttlv::TAG_OPERATION, operation),
                    Item::structure(ttlv::TAG_REQUEST_PAYLOAD, payload),
                ],
            ),
        ],
    )
}

fn name_attribute(key: &str) -> Item {
    Item::structure(
        ttlv::TAG_ATTRIBUTE,
        vec![
            Item::text(ttlv::TAG_ATTRIBUTE_NAME, "Name"),
            Item::structure(
                ttlv::TAG_ATTRIBUTE_VALUE,
                vec![
                    Item::text(ttlv::TAG_NAME_VALUE, key),
                    Item::enumeration(ttlv::TAG_NAME_TYPE, ttlv::NAME_TYPE_TEXT),
                ],
            ),
        ],
    )
}

fn register_request(key: &str, value: &str) -> Item {
    request_message(
        ttlv::OP_REGISTER,
        vec![
            Item::enumeration(ttlv::TAG_OBJECT_TYPE, ttlv::OBJECT_SECRET_DATA),
            Item::structure(ttlv::TAG_TEMPLATE_ATTRIBUTE, vec![name_attribute(key)]),
            Item::structure(
                ttlv::TAG_SECRET_DATA,
                vec![
                    Item::enumeration(ttlv::TAG_SECRET_DATA_TYPE, ttlv::SECRET_DATA_PASSWORD),
                    Item::structure(
                        ttlv::TAG_KEY_BLOCK,
                        vec![
                            Item::enumeration(
                                ttlv::TAG_KEY_FORMAT_TYPE,
                                ttlv::KEY_FORMAT_OPAQUE,
                            ),
                            Item::structure(
                                ttlv::TAG_KEY_VALUE,
                                vec![Item::bytes(ttlv::TAG_KEY_MATERIAL, value.as_bytes())],
                            ),
                        ],
                    ),
                ],
            ),
        ],
    )
}

fn locate_request(key: &str) -> Item {
    request_message(ttlv::OP_LOCATE, vec![name_attribute(key)])
}

fn get_request(uid: &str) -> Item {
    request_message(
        ttlv::OP_GET,
        vec![Item::text(ttlv::TAG_UNIQUE_IDENTIFIER, uid)],
    )
}

fn destroy_request(uid: &str) -> Item {
    request_message(
        ttlv::OP_DESTROY,
        vec![Item::text(ttlv::TAG_UNIQUE_IDENTIFIER, uid)],
    )
}

// =============================================================================
// Adapter
// =============================================================================

#[derive(Debug)]
pub struct KmipKms {
    endpoint: String,
    server_name: String,
    tls: Arc<ClientConfig>,
}

impl KmipKms {
    pub fn new(config: &KmsConfig) -> Result<Self> {
        let endpoint = config.required_detail(PROVIDER_KMIP, "KMIP_ENDPOINT")?;
        let ca_cert = config.required_detail(PROVIDER_KMIP, "CA_CERT")?;
        let client_cert = config.required_detail(PROVIDER_KMIP, "CLIENT_CERT")?;
        let client_key = config.required_detail(PROVIDER_KMIP, "CLIENT_KEY")?;

        let server_name = config
            .detail("TLS_SERVER_NAME")
            .map(str::to_string)
            .unwrap_or_else(|| {
                endpoint
                    .split(':')
                    .next()
                    .unwrap_or(endpoint.as_str())
                    .to_string()
            });

        let mut roots = RootCertStore::empty();
        for cert in pem_certs(&ca_cert)? {
            roots
                .add(&cert)
                .map_err(|e| kmip_error(format!("bad CA certificate: {e}")))?;
        }

        let certs = pem_certs(&client_cert)?;
        let key = pem_key(&client_key)?;
        let tls = ClientConfig::builder()
            .with_safe_defaults()
            .with_root_certificates(roots)
            .with_client_auth_cert(certs, key)
            .map_err(|e| kmip_error(format!("bad client credentials: {e}")))?;

        Ok(Self {
            endpoint,
            server_name,
            tls: Arc::new(tls),
        })
    }

    async fn round_trip(&self, request: &Item) -> Result<Item> {
        let tcp = TcpStream::connect(&self.endpoint).await?;
        let name = rustls::ServerName::try_from(self.server_name.as_str())
            .map_err(|e| kmip_error(format!("invalid TLS server name: {e}")))?;
        let mut stream = TlsConnector::from(self.tls.clone())
            .connect(name, tcp)
            .await?;

        stream.write_all(&request.to_bytes()).await?;
        stream.flush().await?;

        // The response is one TTLV structure; the outer header tells us the
        // total length to read.
        let mut header = [0u8; 8];
        stream.read_exact(&mut header).await?;
        let body_len = u32::from_be_bytes([header[4], header[5], header[6], header[7]]) as usize;
        let mut body = vec![0u8; body_len];
        stream.read_exact(&mut body).await?;

        let mut message = header.to_vec();
        message.extend_from_slice(&body);
        let (item, _) =
            ttlv::decode(&message).ok_or_else(|| kmip_error("unparseable response"))?;

        match item
            .find(ttlv::TAG_RESULT_STATUS)
            .and_then(Item::as_enumeration)
        {
            Some(ttlv::RESULT_SUCCESS) => Ok(item),
            Some(status) => Err(kmip_error(format!("operation failed with status {status}"))),
            None => Err(kmip_error("response carries no result status")),
        }
    }

    async fn locate(&self, key: &str) -> Result<Option<String>> {
        let response = self.round_trip(&locate_request(key)).await?;
        Ok(response
            .find(ttlv::TAG_UNIQUE_IDENTIFIER)
            .and_then(Item::as_text)
            .map(str::to_string))
    }
}

fn kmip_error(reason: impl std::fmt::Display) -> Error {
    Error::Kms {
        provider: PROVIDER_KMIP.to_string(),
        reason: reason.to_string(),
    }
}

fn pem_certs(pem: &str) -> Result<Vec<Certificate>> {
    let certs = rustls_pemfile::certs(&mut Cursor::new(pem.as_bytes()))
        .map_err(|e| kmip_error(format!("bad PEM certificate: {e}")))?;
    if certs.is_empty() {
        return Err(kmip_error("no certificate found in PEM"));
    }
    Ok(certs.into_iter().map(Certificate).collect())
}

fn pem_key(pem: &str) -> Result<PrivateKey> {
    let mut cursor = Cursor::new(pem.as_bytes());
    let keys = rustls_pemfile::pkcs8_private_keys(&mut cursor)
        .map_err(|e| kmip_error(format!("bad PEM key: {e}")))?;
    if let Some(key) = keys.into_iter().next() {
        return Ok(PrivateKey(key));
    }
    let mut cursor = Cursor::new(pem.as_bytes());
    let keys = rustls_pemfile::rsa_private_keys(&mut cursor)
        .map_err(|e| kmip_error(format!("bad PEM key: {e}")))?;
    keys.into_iter()
        .next()
        .map(PrivateKey)
        .ok_or_else(|| kmip_error("no private key found in PEM"))
}

#[async_trait]
impl Kms for KmipKms {
    fn provider_name(&self) -> &'static str {
        PROVIDER_KMIP
    }

    async fn put(&self, key: &str, value: &str) -> Result<()> {
        let response = self.round_trip(&register_request(key, value)).await?;
        let uid = response
            .find(ttlv::TAG_UNIQUE_IDENTIFIER)
            .and_then(Item::as_text)
            .unwrap_or("<none>");
        debug!("registered secret for {} as {}", key, uid);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let Some(uid) = self.locate(key).await? else {
            return Ok(None);
        };
        let response = self.round_trip(&get_request(&uid)).await?;
        let material = response
            .find(ttlv::TAG_KEY_MATERIAL)
            .and_then(Item::as_bytes)
            .ok_or_else(|| kmip_error(format!("no key material returned for {key}")))?;
        Ok(Some(String::from_utf8_lossy(material).to_string()))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let Some(uid) = self.locate(key).await? else {
            return Ok(());
        };
        self.round_trip(&destroy_request(&uid)).await?;
        Ok(())
    }

    async fn update(&self, key: &str, value: &str) -> Result<()> {
        self.delete(key).await?;
        self.put(key, value).await
    }
}

#[cfg(test)]
mod tests {
    use super::ttlv::{self, Item};
    use super::*;

    #[test]
    fn test_ttlv_round_trip() {
        let original = Item::structure(
            ttlv::TAG_REQUEST_PAYLOAD,
            vec![
                Item::text(ttlv::TAG_UNIQUE_IDENTIFIER, "uid-123"),
                Item::enumeration(ttlv::TAG_OPERATION, ttlv::OP_GET),
                Item::integer(ttlv::TAG_BATCH_COUNT, 1),
                Item::bytes(ttlv::TAG_KEY_MATERIAL, b"secret"),
            ],
        );
        let bytes = original.to_bytes();
        let (decoded, used) = ttlv::decode(&bytes).unwrap();
        assert_eq!(used, bytes.len());
        assert_eq!(decoded, original);
    }

    #[test]
    fn test_values_pad_to_eight_bytes() {
        let item = Item::text(ttlv::TAG_NAME_VALUE, "abc");
        let bytes = item.to_bytes();
        // 8-byte header + 3 payload + 5 pad
        assert_eq!(bytes.len(), 16);
        assert_eq!(&bytes[8..], &[b'a', b'b', b'c', 0, 0, 0, 0, 0]);
    }

    #[test]
    fn test_register_request_shape() {
        let request = register_request("pvc-1", "K_new");
        assert_eq!(
            request
                .find(ttlv::TAG_OPERATION)
                .and_then(Item::as_enumeration),
            Some(ttlv::OP_REGISTER)
        );
        assert_eq!(
            request.find(ttlv::TAG_NAME_VALUE).and_then(Item::as_text),
            Some("pvc-1")
        );
        assert_eq!(
            request
                .find(ttlv::TAG_KEY_MATERIAL)
                .and_then(Item::as_bytes),
            Some(b"K_new".as_slice())
        );
    }

    #[test]
    fn test_mandatory_connection_details() {
        let config = KmsConfig::default();
        let err = KmipKms::new(&config).unwrap_err();
        assert!(matches!(
            err,
            Error::KmsMissingDetail { detail, .. } if detail == "KMIP_ENDPOINT"
        ));
    }

    #[test]
    fn test_result_status_lookup() {
        let response = Item::structure(
            ttlv::TAG_REQUEST_MESSAGE,
            vec![Item::structure(
                ttlv::TAG_BATCH_ITEM,
                vec![Item::enumeration(ttlv::TAG_RESULT_STATUS, 0)],
            )],
        );
        assert_eq!(
            response
                .find(ttlv::TAG_RESULT_STATUS)
                .and_then(Item::as_enumeration),
            Some(0)
        );
    }
}

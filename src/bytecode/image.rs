//! Container for every compiled module of one source file, keyed by route.

use super::{put_u32, DecodeError, Reader};
use crate::ast::WsEvent;

pub const IMAGE_MAGIC: [u8; 4] = *b"GLYI";
pub const IMAGE_VERSION: u32 = 1;

const KIND_ROUTE: u8 = 0;
const KIND_WS_EVENT: u8 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    /// Key is `METHOD /path`.
    Route,
    /// Key is `/path event`.
    WsEvent,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ImageEntry {
    pub kind: EntryKind,
    pub key: String,
    pub module: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct ProgramImage {
    pub entries: Vec<ImageEntry>,
}

impl ProgramImage {
    pub fn ws_key(path: &str, event: WsEvent) -> String {
        format!("{} {}", path, event.as_str())
    }

    pub fn push(&mut self, kind: EntryKind, key: impl Into<String>, module: Vec<u8>) {
        self.entries.push(ImageEntry { kind, key: key.into(), module });
    }

    pub fn get(&self, kind: EntryKind, key: &str) -> Option<&[u8]> {
        self.entries
            .iter()
            .find(|e| e.kind == kind && e.key == key)
            .map(|e| e.module.as_slice())
    }

    pub fn routes(&self) -> impl Iterator<Item = &ImageEntry> {
        self.entries.iter().filter(|e| e.kind == EntryKind::Route)
    }

    pub fn ws_events(&self) -> impl Iterator<Item = &ImageEntry> {
        self.entries.iter().filter(|e| e.kind == EntryKind::WsEvent)
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = IMAGE_MAGIC.to_vec();
        put_u32(&mut out, IMAGE_VERSION);
        put_u32(&mut out, self.entries.len() as u32);
        for e in &self.entries {
            out.push(match e.kind {
                EntryKind::Route => KIND_ROUTE,
                EntryKind::WsEvent => KIND_WS_EVENT,
            });
            put_u32(&mut out, e.key.len() as u32);
            out.extend_from_slice(e.key.as_bytes());
            put_u32(&mut out, e.module.len() as u32);
            out.extend_from_slice(&e.module);
        }
        out
    }

    /// Decode the container. Embedded modules are kept as raw bytes; they are
    /// validated when loaded.
    pub fn decode(bytes: &[u8]) -> Result<ProgramImage, DecodeError> {
        if bytes.len() < 8 {
            return Err(DecodeError::TooShort { len: bytes.len() });
        }
        let found = [bytes[0], bytes[1], bytes[2], bytes[3]];
        if found != IMAGE_MAGIC {
            return Err(DecodeError::BadMagic { found });
        }
        let mut r = Reader { bytes, pos: 4 };
        let version = r.u32("image version")?;
        if version != IMAGE_VERSION {
            return Err(DecodeError::UnsupportedVersion { version });
        }
        let count = r.u32("entry count")?;
        let mut entries = Vec::new();
        for _ in 0..count {
            let offset = r.pos;
            let kind = match r.u8("entry kind")? {
                KIND_ROUTE => EntryKind::Route,
                KIND_WS_EVENT => EntryKind::WsEvent,
                tag => return Err(DecodeError::BadConstantTag { tag, offset }),
            };
            let key_len = r.u32("entry key length")? as usize;
            let key = std::str::from_utf8(r.take(key_len, "entry key")?)
                .map_err(|_| DecodeError::InvalidUtf8 { offset })?
                .to_string();
            let len = r.u32("module length")? as usize;
            let module = r.take(len, "module bytes")?.to_vec();
            entries.push(ImageEntry { kind, key, module });
        }
        if r.pos != bytes.len() {
            return Err(DecodeError::TrailingBytes(bytes.len() - r.pos));
        }
        Ok(ProgramImage { entries })
    }
}

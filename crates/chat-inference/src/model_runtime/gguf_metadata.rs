//! GGUF header metadata
//!
//! Reads only the key/value section of a GGUF file (little endian, versions
//! 2 and 3). Values other than the few we need are skipped by type without
//! being materialized, so large tokenizer arrays cost a seek, not an
//! allocation.

use anyhow::{bail, Context, Result};
use serde::Serialize;
use std::fs::File;
use std::io::{BufReader, Read, Seek};
use std::path::Path;

const GGUF_MAGIC: &[u8; 4] = b"GGUF";
const MAX_STRING_LEN: u64 = 64 * 1024 * 1024;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct GgufMetadata {
    pub version: u32,
    pub name: Option<String>,
    pub architecture: Option<String>,
    pub basename: Option<String>,
    pub context_length: Option<u64>,
}

impl GgufMetadata {
    /// Name, architecture and basename joined for template matching.
    pub fn match_hint(&self) -> Option<String> {
        let parts: Vec<&str> = [&self.name, &self.architecture, &self.basename]
            .into_iter()
            .filter_map(|p| p.as_deref())
            .filter(|p| !p.is_empty())
            .collect();
        if parts.is_empty() {
            None
        } else {
            Some(parts.join(" "))
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ValueType {
    U8,
    I8,
    U16,
    I16,
    U32,
    I32,
    F32,
    Bool,
    String,
    Array,
    U64,
    I64,
    F64,
}

impl ValueType {
    fn from_u32(raw: u32) -> Result<Self> {
        Ok(match raw {
            0 => ValueType::U8,
            1 => ValueType::I8,
            2 => ValueType::U16,
            3 => ValueType::I16,
            4 => ValueType::U32,
            5 => ValueType::I32,
            6 => ValueType::F32,
            7 => ValueType::Bool,
            8 => ValueType::String,
            9 => ValueType::Array,
            10 => ValueType::U64,
            11 => ValueType::I64,
            12 => ValueType::F64,
            other => bail!("unknown GGUF value type {}", other),
        })
    }

    fn fixed_size(&self) -> Option<i64> {
        match self {
            ValueType::U8 | ValueType::I8 | ValueType::Bool => Some(1),
            ValueType::U16 | ValueType::I16 => Some(2),
            ValueType::U32 | ValueType::I32 | ValueType::F32 => Some(4),
            ValueType::U64 | ValueType::I64 | ValueType::F64 => Some(8),
            ValueType::String | ValueType::Array => None,
        }
    }
}

struct HeaderReader<R> {
    inner: R,
}

impl<R: Read + Seek> HeaderReader<R> {
    fn u32(&mut self) -> Result<u32> {
        let mut buf = [0u8; 4];
        self.inner.read_exact(&mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }

    fn u64(&mut self) -> Result<u64> {
        let mut buf = [0u8; 8];
        self.inner.read_exact(&mut buf)?;
        Ok(u64::from_le_bytes(buf))
    }

    fn skip(&mut self, bytes: u64) -> Result<()> {
        let offset = i64::try_from(bytes).context("GGUF skip too large")?;
        self.inner.seek(std::io::SeekFrom::Current(offset))?;
        Ok(())
    }

    fn string_len(&mut self) -> Result<u64> {
        let len = self.u64()?;
        if len > MAX_STRING_LEN {
            bail!("GGUF string of {} bytes is implausible", len);
        }
        Ok(len)
    }

    fn string(&mut self) -> Result<String> {
        let len = self.string_len()? as usize;
        let mut buf = vec![0u8; len];
        self.inner.read_exact(&mut buf)?;
        Ok(String::from_utf8_lossy(&buf).into_owned())
    }

    /// Reads an integer value of any width as u64; other types yield `None`.
    fn integer(&mut self, ty: ValueType) -> Result<Option<u64>> {
        let value = match ty {
            ValueType::U32 => Some(self.u32()? as u64),
            ValueType::I32 => Some(self.u32()? as i32 as u64),
            ValueType::U64 | ValueType::I64 => Some(self.u64()?),
            _ => {
                self.skip_value(ty)?;
                None
            }
        };
        Ok(value)
    }

    fn skip_value(&mut self, ty: ValueType) -> Result<()> {
        if let Some(size) = ty.fixed_size() {
            return self.skip(size as u64);
        }
        match ty {
            ValueType::String => {
                let len = self.string_len()?;
                self.skip(len)
            }
            ValueType::Array => {
                let item_ty = ValueType::from_u32(self.u32()?)?;
                let count = self.u64()?;
                match item_ty.fixed_size() {
                    Some(size) => self.skip(count.saturating_mul(size as u64)),
                    None => {
                        for _ in 0..count {
                            self.skip_value(item_ty)?;
                        }
                        Ok(())
                    }
                }
            }
            _ => Ok(()),
        }
    }
}

/// Reads the header of a GGUF file.
pub fn read(path: &Path) -> Result<GgufMetadata> {
    let file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
    read_from(BufReader::new(file)).with_context(|| format!("reading GGUF header of {}", path.display()))
}

pub fn read_from<R: Read + Seek>(inner: R) -> Result<GgufMetadata> {
    let mut reader = HeaderReader { inner };

    let mut magic = [0u8; 4];
    reader.inner.read_exact(&mut magic)?;
    if &magic != GGUF_MAGIC {
        bail!("not a GGUF file");
    }

    let version = reader.u32()?;
    if !(2..=3).contains(&version) {
        bail!("unsupported GGUF version {}", version);
    }

    let _tensor_count = reader.u64()?;
    let kv_count = reader.u64()?;

    let mut meta = GgufMetadata {
        version,
        ..GgufMetadata::default()
    };
    // Architecture is normally written before `<arch>.context_length`, but the
    // format does not promise it; keep every candidate until the end.
    let mut context_lengths: Vec<(String, u64)> = Vec::new();

    for _ in 0..kv_count {
        let key = reader.string()?;
        let ty = ValueType::from_u32(reader.u32()?)?;

        match (key.as_str(), ty) {
            ("general.name", ValueType::String) => meta.name = Some(reader.string()?),
            ("general.architecture", ValueType::String) => meta.architecture = Some(reader.string()?),
            ("general.basename", ValueType::String) => meta.basename = Some(reader.string()?),
            (k, _) if k.ends_with(".context_length") => {
                let prefix = k.trim_end_matches(".context_length").to_string();
                if let Some(value) = reader.integer(ty)? {
                    context_lengths.push((prefix, value));
                }
            }
            _ => reader.skip_value(ty)?,
        }
    }

    if let Some(arch) = &meta.architecture {
        meta.context_length = context_lengths
            .into_iter()
            .find(|(prefix, _)| prefix == arch)
            .map(|(_, v)| v);
    }

    Ok(meta)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::io::Cursor;

    /// Header-only GGUF image with a name, an architecture and its context length.
    pub(crate) fn header_bytes(name: &str, arch: &str, context_length: u32) -> Vec<u8> {
        Builder::default()
            .string("general.architecture", arch)
            .string("general.name", name)
            .u32(&format!("{}.context_length", arch), context_length)
            .build(3)
    }

    #[derive(Default)]
    struct Builder {
        kvs: Vec<u8>,
        count: u64,
    }

    impl Builder {
        fn key(&mut self, key: &str, ty: u32) {
            self.kvs.extend((key.len() as u64).to_le_bytes());
            self.kvs.extend(key.as_bytes());
            self.kvs.extend(ty.to_le_bytes());
            self.count += 1;
        }

        fn string(mut self, key: &str, value: &str) -> Self {
            self.key(key, 8);
            self.kvs.extend((value.len() as u64).to_le_bytes());
            self.kvs.extend(value.as_bytes());
            self
        }

        fn u32(mut self, key: &str, value: u32) -> Self {
            self.key(key, 4);
            self.kvs.extend(value.to_le_bytes());
            self
        }

        fn string_array(mut self, key: &str, items: &[&str]) -> Self {
            self.key(key, 9);
            self.kvs.extend(8u32.to_le_bytes());
            self.kvs.extend((items.len() as u64).to_le_bytes());
            for item in items {
                self.kvs.extend((item.len() as u64).to_le_bytes());
                self.kvs.extend(item.as_bytes());
            }
            self
        }

        fn f32_array(mut self, key: &str, items: &[f32]) -> Self {
            self.key(key, 9);
            self.kvs.extend(6u32.to_le_bytes());
            self.kvs.extend((items.len() as u64).to_le_bytes());
            for item in items {
                self.kvs.extend(item.to_le_bytes());
            }
            self
        }

        fn build(self, version: u32) -> Vec<u8> {
            let mut out = Vec::new();
            out.extend(GGUF_MAGIC);
            out.extend(version.to_le_bytes());
            out.extend(0u64.to_le_bytes());
            out.extend(self.count.to_le_bytes());
            out.extend(self.kvs);
            out
        }
    }

    #[test]
    fn reads_general_keys_and_context_length() {
        let bytes = Builder::default()
            .string("general.architecture", "llama")
            .string_array("tokenizer.ggml.tokens", &["<s>", "</s>", "hello"])
            .f32_array("tokenizer.ggml.scores", &[0.0, 1.5, -2.0])
            .string("general.name", "Llama 2 7B Chat")
            .u32("llama.context_length", 4096)
            .u32("bert.context_length", 512)
            .build(3);

        let meta = read_from(Cursor::new(bytes)).unwrap();
        assert_eq!(meta.version, 3);
        assert_eq!(meta.architecture.as_deref(), Some("llama"));
        assert_eq!(meta.name.as_deref(), Some("Llama 2 7B Chat"));
        assert_eq!(meta.context_length, Some(4096));
        assert_eq!(meta.match_hint().as_deref(), Some("Llama 2 7B Chat llama"));
    }

    #[test]
    fn context_length_before_architecture_is_kept() {
        let bytes = Builder::default()
            .u32("qwen2.context_length", 32768)
            .string("general.architecture", "qwen2")
            .build(2);
        let meta = read_from(Cursor::new(bytes)).unwrap();
        assert_eq!(meta.context_length, Some(32768));
    }

    #[test]
    fn rejects_other_files() {
        assert!(read_from(Cursor::new(b"ggjt\x01\x00\x00\x00".to_vec())).is_err());
        let old = Builder::default().build(1);
        assert!(read_from(Cursor::new(old)).is_err());
    }

    #[test]
    fn truncated_header_is_an_error() {
        let mut bytes = Builder::default().string("general.name", "x").build(3);
        bytes.truncate(bytes.len() - 1);
        assert!(read_from(Cursor::new(bytes)).is_err());
    }
}

//! Model format detection
//!
//! Extension first; `.bin`/`.ggml` are disambiguated by their magic bytes and
//! `.pt`/`.pth` by name.

use crate::error::InferenceError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::Read;
use std::path::Path;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ModelFormat {
    Gguf,
    Ggml,
    Onnx,
    Safetensors,
    Pytorch,
    Rwkv,
}

impl ModelFormat {
    pub fn name(&self) -> &'static str {
        match self {
            ModelFormat::Gguf => "GGUF",
            ModelFormat::Ggml => "GGML",
            ModelFormat::Onnx => "ONNX",
            ModelFormat::Safetensors => "SAFETENSORS",
            ModelFormat::Pytorch => "PYTORCH",
            ModelFormat::Rwkv => "RWKV",
        }
    }
}

impl fmt::Display for ModelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Magic strings of the legacy GGML family, as stored in the first 4 bytes.
/// Older writers stored the u32 magic little endian, so both orders appear.
const GGML_MAGICS: [&[u8; 4]; 4] = [b"ggml", b"lmgg", b"ggjt", b"tjgg"];

pub struct FormatDetector;

impl FormatDetector {
    pub fn detect(path: &Path) -> Result<ModelFormat, InferenceError> {
        if !path.exists() {
            return Err(InferenceError::FileNotFound(path.to_path_buf()));
        }

        let extension = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_lowercase())
            .unwrap_or_default();
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_lowercase())
            .unwrap_or_default();

        let format = match extension.as_str() {
            "gguf" => Some(ModelFormat::Gguf),
            "onnx" => Some(ModelFormat::Onnx),
            "safetensors" => Some(ModelFormat::Safetensors),
            "ggml" | "bin" => Self::sniff_binary(path, &file_name, &extension)?,
            "pt" | "pth" if file_name.contains("rwkv") => Some(ModelFormat::Rwkv),
            "pt" | "pth" => Some(ModelFormat::Pytorch),
            _ => None,
        };

        match format {
            Some(fmt) => {
                info!("Detected model format: {} for file: {}", fmt, path.display());
                Ok(fmt)
            }
            None => Err(InferenceError::FormatUnsupported(path.to_path_buf())),
        }
    }

    fn sniff_binary(path: &Path, file_name: &str, extension: &str) -> Result<Option<ModelFormat>, InferenceError> {
        let magic = Self::read_magic(path)?;
        if let Some(magic) = magic {
            if GGML_MAGICS.iter().any(|m| **m == magic) {
                return Ok(Some(ModelFormat::Ggml));
            }
            debug!("{} has no GGML magic ({:?})", path.display(), String::from_utf8_lossy(&magic));
        }

        if extension == "bin" && (file_name.contains("pytorch") || file_name.contains("model")) {
            return Ok(Some(ModelFormat::Pytorch));
        }
        Ok(None)
    }

    /// First 4 bytes, or `None` for shorter files.
    fn read_magic(path: &Path) -> Result<Option<[u8; 4]>, InferenceError> {
        let mut file = std::fs::File::open(path)?;
        let mut magic = [0u8; 4];
        match file.read_exact(&mut magic) {
            Ok(()) => Ok(Some(magic)),
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

//! GGUF tensor container (versions 2 and 3).
//!
//! Layout: magic `GGUF`, `u32` version, `u64` tensor count, `u64` metadata
//! count, metadata key/value pairs, tensor infos, then the data section
//! aligned to `general.alignment` (default 32). All integers little-endian.
//! Only `F32` and `F16` tensors are decoded.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use half::f16;

use super::{checked_element_count, Tensor, WeightError, WeightSource};

const MAGIC: &[u8; 4] = b"GGUF";
const DEFAULT_ALIGNMENT: usize = 32;

const GGML_TYPE_F32: u32 = 0;
const GGML_TYPE_F16: u32 = 1;

// Metadata value type tags.
const KV_U8: u32 = 0;
const KV_I8: u32 = 1;
const KV_U16: u32 = 2;
const KV_I16: u32 = 3;
const KV_U32: u32 = 4;
const KV_I32: u32 = 5;
const KV_F32: u32 = 6;
const KV_BOOL: u32 = 7;
const KV_STRING: u32 = 8;
const KV_ARRAY: u32 = 9;
const KV_U64: u32 = 10;
const KV_I64: u32 = 11;
const KV_F64: u32 = 12;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TensorInfo {
    pub name: String,
    /// Fastest-varying first, padded with 1 to rank 4.
    pub dims: [usize; 4],
    pub ggml_type: u32,
    /// Byte offset from the start of the data section.
    pub offset: usize,
}

impl TensorInfo {
    /// `None` when the dimensions overflow `usize`.
    fn element_count(&self) -> Option<usize> {
        checked_element_count(&self.dims)
    }

    /// Bytes per element, `None` for types that are not decoded.
    fn type_width(&self) -> Option<usize> {
        match self.ggml_type {
            GGML_TYPE_F32 => Some(4),
            GGML_TYPE_F16 => Some(2),
            _ => None,
        }
    }

    fn byte_len(&self, width: usize) -> Result<usize, WeightError> {
        self.element_count()
            .and_then(|n| n.checked_mul(width))
            .ok_or_else(|| malformed(format!("tensor {} dims {:?} overflow", self.name, self.dims)))
    }
}

/// Parsed container; tensor payloads are decoded on lookup.
#[derive(Debug)]
pub struct GgufFile {
    version: u32,
    architecture: Option<String>,
    alignment: usize,
    tensors: Vec<TensorInfo>,
    index: HashMap<String, usize>,
    bytes: Vec<u8>,
    data_start: usize,
}

impl GgufFile {
    pub fn open(path: &Path) -> Result<Self, WeightError> {
        let bytes = fs::read(path).map_err(|source| WeightError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let file = Self::from_bytes(bytes)?;
        tracing::info!(
            path = %path.display(),
            version = file.version,
            tensors = file.tensors.len(),
            architecture = file.architecture.as_deref().unwrap_or("unknown"),
            "weight container opened"
        );
        Ok(file)
    }

    pub fn from_bytes(bytes: Vec<u8>) -> Result<Self, WeightError> {
        let mut r = Reader::new(&bytes);
        if r.take(4)? != MAGIC {
            return Err(malformed("missing GGUF magic"));
        }
        let version = r.u32()?;
        if !(2..=3).contains(&version) {
            return Err(malformed(format!("unsupported GGUF version {version}")));
        }
        let n_tensors = r.len_u64()?;
        let n_kv = r.len_u64()?;

        let mut alignment = DEFAULT_ALIGNMENT;
        let mut architecture = None;
        for _ in 0..n_kv {
            let key = r.string()?;
            let ty = r.u32()?;
            match (key.as_str(), ty) {
                ("general.alignment", KV_U32) => {
                    alignment = r.u32()? as usize;
                    if alignment == 0 || !alignment.is_power_of_two() {
                        return Err(malformed(format!("invalid alignment {alignment}")));
                    }
                }
                ("general.architecture", KV_STRING) => architecture = Some(r.string()?),
                _ => r.skip_value(ty)?,
            }
        }

        let mut tensors = Vec::with_capacity(n_tensors.min(4096));
        let mut index = HashMap::with_capacity(n_tensors.min(4096));
        for _ in 0..n_tensors {
            let name = r.string()?;
            let rank = r.u32()? as usize;
            if rank > 4 {
                return Err(malformed(format!("tensor {name} has rank {rank}")));
            }
            let mut dims = [1usize; 4];
            for d in dims.iter_mut().take(rank) {
                *d = r.len_u64()?;
            }
            let ggml_type = r.u32()?;
            let offset = r.len_u64()?;
            if checked_element_count(&dims).is_none() {
                return Err(malformed(format!("tensor {name} dims {dims:?} overflow")));
            }
            if index.insert(name.clone(), tensors.len()).is_some() {
                return Err(malformed(format!("duplicate tensor {name}")));
            }
            tensors.push(TensorInfo {
                name,
                dims,
                ggml_type,
                offset,
            });
        }

        let data_start = r.pos.next_multiple_of(alignment);
        for info in &tensors {
            // Unsupported types are reported on lookup, not here.
            let Some(width) = info.type_width() else {
                continue;
            };
            let len = info.byte_len(width)?;
            let end = data_start
                .checked_add(info.offset)
                .and_then(|s| s.checked_add(len));
            if end.map_or(true, |end| end > bytes.len()) {
                return Err(malformed(format!(
                    "tensor {} extends past the end of the container",
                    info.name
                )));
            }
        }

        Ok(Self {
            version,
            architecture,
            alignment,
            tensors,
            index,
            bytes,
            data_start,
        })
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn architecture(&self) -> Option<&str> {
        self.architecture.as_deref()
    }

    pub fn alignment(&self) -> usize {
        self.alignment
    }

    pub fn tensors(&self) -> &[TensorInfo] {
        &self.tensors
    }

    pub fn tensor_info(&self, name: &str) -> Option<&TensorInfo> {
        self.index.get(name).map(|&i| &self.tensors[i])
    }
}

impl WeightSource for GgufFile {
    fn fetch(&self, name: &str) -> Result<Tensor, WeightError> {
        let info = self
            .tensor_info(name)
            .ok_or_else(|| WeightError::MissingTensor {
                name: name.to_string(),
            })?;
        let width = info
            .type_width()
            .ok_or_else(|| WeightError::UnsupportedTensorType {
                name: name.to_string(),
                ggml_type: info.ggml_type,
            })?;
        let len = info.byte_len(width)?;
        // Bounds were checked when the container was parsed.
        let start = self.data_start + info.offset;
        let raw = &self.bytes[start..start + len];
        let data: Vec<f32> = match info.ggml_type {
            GGML_TYPE_F32 => raw
                .chunks_exact(4)
                .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
                .collect(),
            _ => raw
                .chunks_exact(2)
                .map(|b| f16::from_le_bytes([b[0], b[1]]).to_f32())
                .collect(),
        };
        Tensor::new(&info.dims, data)
    }
}

fn malformed(reason: impl Into<String>) -> WeightError {
    WeightError::Malformed {
        reason: reason.into(),
    }
}

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], WeightError> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|&end| end <= self.bytes.len())
            .ok_or_else(|| malformed(format!("unexpected end of data at byte {}", self.pos)))?;
        let out = &self.bytes[self.pos..end];
        self.pos = end;
        Ok(out)
    }

    fn u32(&mut self) -> Result<u32, WeightError> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn u64(&mut self) -> Result<u64, WeightError> {
        let b = self.take(8)?;
        let mut le = [0u8; 8];
        le.copy_from_slice(b);
        Ok(u64::from_le_bytes(le))
    }

    fn len_u64(&mut self) -> Result<usize, WeightError> {
        let v = self.u64()?;
        usize::try_from(v).map_err(|_| malformed(format!("length {v} does not fit in memory")))
    }

    fn string(&mut self) -> Result<String, WeightError> {
        let len = self.len_u64()?;
        let raw = self.take(len)?;
        String::from_utf8(raw.to_vec()).map_err(|_| malformed("string is not valid UTF-8"))
    }

    fn skip_value(&mut self, ty: u32) -> Result<(), WeightError> {
        match ty {
            KV_STRING => {
                let len = self.len_u64()?;
                self.take(len)?;
            }
            KV_ARRAY => {
                let elem = self.u32()?;
                let count = self.len_u64()?;
                match scalar_width(elem) {
                    Some(w) => {
                        let total = count
                            .checked_mul(w)
                            .ok_or_else(|| malformed("array length overflow"))?;
                        self.take(total)?;
                    }
                    None => {
                        for _ in 0..count {
                            self.skip_value(elem)?;
                        }
                    }
                }
            }
            other => {
                let w = scalar_width(other)
                    .ok_or_else(|| malformed(format!("unknown metadata type {other}")))?;
                self.take(w)?;
            }
        }
        Ok(())
    }
}

fn scalar_width(ty: u32) -> Option<usize> {
    match ty {
        KV_U8 | KV_I8 | KV_BOOL => Some(1),
        KV_U16 | KV_I16 => Some(2),
        KV_U32 | KV_I32 | KV_F32 => Some(4),
        KV_U64 | KV_I64 | KV_F64 => Some(8),
        _ => None,
    }
}

/// Serializes a GGUF v3 container; used to export synthetic models.
#[derive(Debug, Default)]
pub struct GgufWriter {
    architecture: Option<String>,
    metadata: Vec<(String, String)>,
    tensors: Vec<(String, [usize; 4], u32, Vec<u8>)>,
}

impl GgufWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn architecture(mut self, name: &str) -> Self {
        self.architecture = Some(name.to_string());
        self
    }

    /// Extra string metadata; readers skip it.
    pub fn metadata_string(mut self, key: &str, value: &str) -> Self {
        self.metadata.push((key.to_string(), value.to_string()));
        self
    }

    pub fn tensor_f32(mut self, name: &str, tensor: &Tensor) -> Self {
        let bytes = tensor.data().iter().flat_map(|v| v.to_le_bytes()).collect();
        self.tensors
            .push((name.to_string(), tensor.dims(), GGML_TYPE_F32, bytes));
        self
    }

    pub fn tensor_f16(mut self, name: &str, tensor: &Tensor) -> Self {
        let bytes = tensor
            .data()
            .iter()
            .flat_map(|&v| f16::from_f32(v).to_le_bytes())
            .collect();
        self.tensors
            .push((name.to_string(), tensor.dims(), GGML_TYPE_F16, bytes));
        self
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        fn put_string(out: &mut Vec<u8>, s: &str) {
            out.extend_from_slice(&(s.len() as u64).to_le_bytes());
            out.extend_from_slice(s.as_bytes());
        }

        let mut out = Vec::new();
        out.extend_from_slice(MAGIC);
        out.extend_from_slice(&3u32.to_le_bytes());
        out.extend_from_slice(&(self.tensors.len() as u64).to_le_bytes());
        let n_kv = self.metadata.len() + usize::from(self.architecture.is_some());
        out.extend_from_slice(&(n_kv as u64).to_le_bytes());

        if let Some(arch) = &self.architecture {
            put_string(&mut out, "general.architecture");
            out.extend_from_slice(&KV_STRING.to_le_bytes());
            put_string(&mut out, arch);
        }
        for (key, value) in &self.metadata {
            put_string(&mut out, key);
            out.extend_from_slice(&KV_STRING.to_le_bytes());
            put_string(&mut out, value);
        }

        let mut offset = 0usize;
        let mut offsets = Vec::with_capacity(self.tensors.len());
        for (name, dims, ty, bytes) in &self.tensors {
            put_string(&mut out, name);
            out.extend_from_slice(&4u32.to_le_bytes());
            for d in dims {
                out.extend_from_slice(&(*d as u64).to_le_bytes());
            }
            out.extend_from_slice(&ty.to_le_bytes());
            out.extend_from_slice(&(offset as u64).to_le_bytes());
            offsets.push(offset);
            offset = (offset + bytes.len()).next_multiple_of(DEFAULT_ALIGNMENT);
        }

        let data_start = out.len().next_multiple_of(DEFAULT_ALIGNMENT);
        out.resize(data_start, 0);
        for ((_, _, _, bytes), off) in self.tensors.iter().zip(offsets) {
            out.resize(data_start + off, 0);
            out.extend_from_slice(bytes);
        }
        out
    }

    pub fn write(&self, path: &Path) -> Result<(), WeightError> {
        fs::write(path, self.to_bytes()).map_err(|source| WeightError::Io {
            path: path.to_path_buf(),
            source,
        })
    }
}

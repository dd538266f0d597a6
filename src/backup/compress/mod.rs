pub mod gzip;
pub mod xz;

use crate::backup::finish::Finish;
use crate::backup::function_path;
use crate::backup::result_error::result::Result;
use crate::backup::result_error::AddFunctionName;
use derive_more::From;
use flate2::write::GzEncoder;
use function_name::named;
use io_enum::Write;
use liblzma::write::XzEncoder;
use serde::{Deserialize, Serialize};
use std::io;
use std::io::Write;
use std::result;
use validator::{Validate, ValidationErrors};

/// Extension of the uncompressed dump, before any compressor extension.
pub static DUMP_FILE_EXT: &str = "sql";

#[derive(Write, From)]
pub enum Compressor<W: Write> {
    None(W),
    GzEncoder(GzEncoder<W>),
    XzEncoder(XzEncoder<W>),
}

/// Compression applied to the dump tool output before it lands in the
/// artifact. Gzip is the default and yields `.sql.gz` artifacts.
#[derive(Clone, From, Serialize, Deserialize, Debug, PartialEq, Eq)]
#[serde(tag = "compressor_type")]
#[serde(rename_all = "snake_case")]
#[serde(deny_unknown_fields)]
pub enum CompressorConfig {
    None,
    Gzip(gzip::GzipConfig),
    Xz(xz::XzConfig),
}

impl Default for CompressorConfig {
    fn default() -> Self {
        CompressorConfig::Gzip(gzip::GzipConfig::default())
    }
}

impl Validate for CompressorConfig {
    fn validate(&self) -> result::Result<(), ValidationErrors> {
        match self {
            CompressorConfig::None => Ok(()),
            CompressorConfig::Gzip(gzip) => gzip.validate(),
            CompressorConfig::Xz(xz) => xz.validate(),
        }
    }
}

pub trait CompressorBuilder<W: Write> {
    fn build_compressor(&self, writer: W) -> Result<Compressor<W>>;
}

impl<W: Write> Finish<W> for Compressor<W> {
    fn finish(self) -> io::Result<W> {
        match self {
            Compressor::None(w) => Ok(w),
            Compressor::GzEncoder(w) => w.finish(),
            Compressor::XzEncoder(w) => w.finish(),
        }
    }
}

impl<W: Write> CompressorBuilder<W> for CompressorConfig {
    #[named]
    fn build_compressor(&self, writer: W) -> Result<Compressor<W>> {
        match self {
            CompressorConfig::None => Ok(Compressor::None(writer)),
            CompressorConfig::Gzip(gzip) => gzip.build_compressor(writer),
            CompressorConfig::Xz(xz) => xz.build_compressor(writer),
        }
        .add_fn_name(function_path!())
    }
}

/// Extension a writer stage appends to the file it produces, if any.
pub trait FileExtProvider {
    fn file_ext(&self) -> Option<&'static str>;
}

impl FileExtProvider for CompressorConfig {
    fn file_ext(&self) -> Option<&'static str> {
        match self {
            CompressorConfig::None => None,
            CompressorConfig::Gzip(_) => Some("gz"),
            CompressorConfig::Xz(_) => Some("xz"),
        }
    }
}

impl CompressorConfig {
    /// Extensions of artifacts written by any compressor. A class directory
    /// keeps old artifacts after the compressor is changed.
    pub fn all_artifact_exts() -> Vec<String> {
        [
            CompressorConfig::None,
            CompressorConfig::Gzip(gzip::GzipConfig::default()),
            CompressorConfig::Xz(xz::XzConfig::default()),
        ]
        .iter()
        .map(CompressorConfig::artifact_ext)
        .collect()
    }

    /// Full artifact extension, e.g. `sql.gz`.
    pub fn artifact_ext(&self) -> String {
        match self.file_ext() {
            Some(ext) => format!("{DUMP_FILE_EXT}.{ext}"),
            None => DUMP_FILE_EXT.to_string(),
        }
    }
}

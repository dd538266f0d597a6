use crate::backup::compress::{Compressor, CompressorBuilder};
use crate::backup::result_error::result::Result;
use bon::Builder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;
use std::io::Write;
use validator::Validate;

static DEFAULT_COMPRESSION_LEVEL: u32 = 6;

/// Gzip (deflate) compression of the dump stream.
#[skip_serializing_none]
#[derive(Clone, Default, Validate, Serialize, Deserialize, Debug, PartialEq, Eq, Builder)]
#[serde(deny_unknown_fields)]
pub struct GzipConfig {
    /// 0 (store) to 9 (smallest), defaults to 6
    #[validate(range(min = 0, max = 9))]
    level: Option<u32>,
}

impl<W: Write> CompressorBuilder<W> for GzipConfig {
    fn build_compressor(&self, writer: W) -> Result<Compressor<W>> {
        let level = self.level.unwrap_or(DEFAULT_COMPRESSION_LEVEL);
        tracing::debug!("Creating gzip compressor with level={}", level);
        Ok(GzEncoder::new(writer, Compression::new(level)).into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::finish::Finish;
    use flate2::read::GzDecoder;
    use std::io::{Cursor, Read};

    #[test]
    fn test_gzip_config_validation() {
        assert!(GzipConfig::builder().level(9).build().validate().is_ok());
        assert!(GzipConfig::builder().level(10).build().validate().is_err());
        assert!(GzipConfig::default().validate().is_ok());
    }

    #[test]
    fn test_gzip_compressor_output_decodes() {
        let mut compressor = GzipConfig::default()
            .build_compressor(Cursor::new(Vec::new()))
            .unwrap();
        compressor.write_all(b"INSERT INTO t VALUES (1);").unwrap();
        let bytes = compressor.finish().unwrap().into_inner();

        let mut decoded = String::new();
        GzDecoder::new(bytes.as_slice())
            .read_to_string(&mut decoded)
            .unwrap();
        assert_eq!(decoded, "INSERT INTO t VALUES (1);");
    }
}

use std::fs;
use std::io::{self, BufReader, Read, Write};
use std::path::PathBuf;
use std::process::Command;

use camino::Utf8Path;
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;

use crate::error::KiraError;
use crate::store::Store;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Raw structure payload to canonical container.
///
/// Implementations must leave either a complete file at `destination` or no
/// file at all.
pub trait FormatConverter: Send + Sync {
    fn output_extension(&self, member_name: &str) -> String;

    fn convert(&self, raw: &mut dyn Read, destination: &Utf8Path) -> Result<(), KiraError>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct GzipPassthrough;

impl FormatConverter for GzipPassthrough {
    fn output_extension(&self, member_name: &str) -> String {
        let stem = member_name.strip_suffix(".gz").unwrap_or(member_name);
        match stem.rsplit_once('.') {
            Some((_, ext)) if !ext.is_empty() => format!("{}.gz", ext.to_lowercase()),
            _ => "gz".to_string(),
        }
    }

    fn convert(&self, raw: &mut dyn Read, destination: &Utf8Path) -> Result<(), KiraError> {
        let mut head = [0u8; 2];
        let filled = read_prefix(raw, &mut head)?;
        if filled == 0 {
            return Err(KiraError::ConversionFailure("empty model payload".to_string()));
        }
        let mut chained = (&head[..filled]).chain(raw);

        let temp = Store::temp_beside(destination)?;
        let temp = if head[..filled] == GZIP_MAGIC {
            let mut temp = temp;
            io::copy(&mut chained, &mut temp)
                .map_err(|err| KiraError::ConversionFailure(err.to_string()))?;
            temp
        } else {
            let mut encoder = GzEncoder::new(temp, Compression::default());
            io::copy(&mut chained, &mut encoder)
                .map_err(|err| KiraError::ConversionFailure(err.to_string()))?;
            encoder
                .finish()
                .map_err(|err| KiraError::ConversionFailure(err.to_string()))?
        };
        Store::persist(temp, destination)
    }
}

#[derive(Debug, Clone)]
pub struct CommandConverter {
    program: PathBuf,
    args: Vec<String>,
    extension: String,
}

impl CommandConverter {
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>, extension: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args,
            extension: extension.into(),
        }
    }
}

impl FormatConverter for CommandConverter {
    fn output_extension(&self, _member_name: &str) -> String {
        self.extension.clone()
    }

    fn convert(&self, raw: &mut dyn Read, destination: &Utf8Path) -> Result<(), KiraError> {
        let mut head = [0u8; 2];
        let filled = read_prefix(raw, &mut head)?;
        let chained = (&head[..filled]).chain(raw);
        let mut reader: Box<dyn Read + '_> = if head[..filled] == GZIP_MAGIC {
            Box::new(GzDecoder::new(BufReader::new(chained)))
        } else {
            Box::new(chained)
        };

        let mut input = tempfile::Builder::new()
            .prefix(".kira-csm-raw")
            .tempfile()
            .map_err(|err| KiraError::Filesystem(err.to_string()))?;
        io::copy(&mut reader, &mut input)
            .map_err(|err| KiraError::ConversionFailure(err.to_string()))?;
        input
            .flush()
            .map_err(|err| KiraError::Filesystem(err.to_string()))?;

        let output = Store::temp_beside(destination)?;
        let output_path = output.path().to_path_buf();
        let result = Command::new(&self.program)
            .args(&self.args)
            .arg(input.path())
            .arg(&output_path)
            .output()
            .map_err(|err| {
                KiraError::ConversionFailure(format!("{}: {err}", self.program.display()))
            })?;
        if !result.status.success() {
            let stderr = String::from_utf8_lossy(&result.stderr).trim().to_string();
            let message = if stderr.is_empty() {
                format!("{} exited with {}", self.program.display(), result.status)
            } else {
                stderr
            };
            return Err(KiraError::ConversionFailure(message));
        }
        let written = fs::metadata(&output_path)
            .map_err(|err| KiraError::ConversionFailure(err.to_string()))?
            .len();
        if written == 0 {
            return Err(KiraError::ConversionFailure(format!(
                "{} produced an empty file",
                self.program.display()
            )));
        }
        Store::persist(output, destination)
    }
}

fn read_prefix(raw: &mut dyn Read, buf: &mut [u8]) -> Result<usize, KiraError> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = raw
            .read(&mut buf[filled..])
            .map_err(|err| KiraError::ConversionFailure(err.to_string()))?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

#[cfg(test)]
mod tests {
    use camino::Utf8PathBuf;

    use super::*;

    #[test]
    fn passthrough_extension() {
        let converter = GzipPassthrough;
        assert_eq!(converter.output_extension("AF-P1-F1-model_v4.cif.gz"), "cif.gz");
        assert_eq!(converter.output_extension("model.PDB"), "pdb.gz");
    }

    #[test]
    fn passthrough_compresses_plain_input() {
        let temp = tempfile::tempdir().unwrap();
        let dest = Utf8PathBuf::from_path_buf(temp.path().join("out.cif.gz")).unwrap();
        GzipPassthrough
            .convert(&mut b"data_model\n".as_slice(), &dest)
            .unwrap();

        let mut body = String::new();
        GzDecoder::new(fs::File::open(dest.as_std_path()).unwrap())
            .read_to_string(&mut body)
            .unwrap();
        assert_eq!(body, "data_model\n");
    }

    #[test]
    fn empty_payload_leaves_no_file() {
        let temp = tempfile::tempdir().unwrap();
        let dest = Utf8PathBuf::from_path_buf(temp.path().join("out.cif.gz")).unwrap();
        let err = GzipPassthrough.convert(&mut io::empty(), &dest).unwrap_err();
        assert!(matches!(err, KiraError::ConversionFailure(_)));
        assert!(!dest.as_std_path().exists());
        assert_eq!(fs::read_dir(temp.path()).unwrap().count(), 0);
    }
}

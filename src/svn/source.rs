use std::io::Read as _;
use std::path::{Path, PathBuf};

#[derive(Debug)]
pub(crate) enum OpenError {
    FileOpenError {
        path: PathBuf,
        error: std::io::Error,
    },
    FileReadError {
        path: PathBuf,
        error: std::io::Error,
    },
    DecoderError {
        path: PathBuf,
        error: std::io::Error,
    },
}

impl std::fmt::Display for OpenError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::FileOpenError { path, error } => {
                write!(f, "failed to open file {path:?}: {error}")
            }
            Self::FileReadError { path, error } => {
                write!(f, "failed to read file {path:?}: {error}")
            }
            Self::DecoderError { path, error } => {
                write!(f, "failed to set up decoder for {path:?}: {error}")
            }
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum Compression {
    None,
    Zstd,
    Gzip,
    Bzip2,
    Xz,
    Lz4,
}

const ZSTD_MAGIC: &[u8] = &[0x28, 0xB5, 0x2F, 0xFD];
const GZIP_MAGIC: &[u8] = &[0x1F, 0x8B];
const BZIP2_MAGIC: &[u8] = b"BZh";
const XZ_MAGIC: &[u8] = &[0xFD, 0x37, 0x7A, 0x58, 0x5A, 0x00];
const LZ4_MAGIC: &[u8] = &[0x04, 0x22, 0x4D, 0x18];

const HEADER_SIZE: usize = 6;

impl Compression {
    pub(crate) fn detect(header: &[u8]) -> Self {
        if header.starts_with(ZSTD_MAGIC) {
            Self::Zstd
        } else if header.starts_with(GZIP_MAGIC) {
            Self::Gzip
        } else if header.starts_with(BZIP2_MAGIC) {
            Self::Bzip2
        } else if header.starts_with(XZ_MAGIC) {
            Self::Xz
        } else if header.starts_with(LZ4_MAGIC) {
            Self::Lz4
        } else {
            Self::None
        }
    }
}

/// A dump stream, transparently decompressed.
pub(crate) struct DumpSource {
    compression: Compression,
    stream: std::io::BufReader<Box<dyn std::io::Read>>,
}

impl DumpSource {
    /// Opens `path`, or the standard input when it is `-`.
    pub(crate) fn open(path: &Path) -> Result<Self, OpenError> {
        let raw: Box<dyn std::io::Read> = if path == Path::new("-") {
            Box::new(std::io::stdin().lock())
        } else {
            let file = std::fs::OpenOptions::new()
                .read(true)
                .open(path)
                .map_err(|e| OpenError::FileOpenError {
                    path: path.to_path_buf(),
                    error: e,
                })?;
            Box::new(file)
        };
        Self::from_reader(path, raw)
    }

    pub(crate) fn from_reader(
        path: &Path,
        mut raw: Box<dyn std::io::Read>,
    ) -> Result<Self, OpenError> {
        // The stream might not be seekable, so the sniffed header is
        // chained back in front of the rest.
        let mut header = Vec::<u8>::with_capacity(HEADER_SIZE);
        while header.len() < HEADER_SIZE {
            let mut buf = [0; HEADER_SIZE];
            match raw.read(&mut buf[..(HEADER_SIZE - header.len())]) {
                Ok(0) => break,
                Ok(n) => header.extend(&buf[..n]),
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
                Err(e) => {
                    return Err(OpenError::FileReadError {
                        path: path.to_path_buf(),
                        error: e,
                    });
                }
            }
        }

        let compression = Compression::detect(&header);
        let rejoined = std::io::Cursor::new(header).chain(raw);

        let decoded: Box<dyn std::io::Read> = match compression {
            Compression::None => Box::new(rejoined),
            Compression::Zstd => Box::new(zstd::stream::read::Decoder::new(rejoined).map_err(
                |e| OpenError::DecoderError {
                    path: path.to_path_buf(),
                    error: e,
                },
            )?),
            Compression::Gzip => Box::new(flate2::read::MultiGzDecoder::new(rejoined)),
            Compression::Bzip2 => Box::new(bzip2::read::MultiBzDecoder::new(rejoined)),
            Compression::Xz => Box::new(liblzma::read::XzDecoder::new_multi_decoder(rejoined)),
            Compression::Lz4 => Box::new(lz4_flex::frame::FrameDecoder::new(rejoined)),
        };

        tracing::debug!("dump source compression: {compression:?}");

        Ok(Self {
            compression,
            stream: std::io::BufReader::with_capacity(1024 * 1024, decoded),
        })
    }

    #[inline]
    pub(crate) fn compression(&self) -> Compression {
        self.compression
    }

    pub(crate) fn stream(&mut self) -> &mut dyn std::io::BufRead {
        &mut self.stream
    }
}

#[cfg(test)]
mod tests {
    use std::io::{Read as _, Write as _};
    use std::path::Path;

    use super::{Compression, DumpSource};

    const DATA: &[u8] = b"SVN-fs-dump-format-version: 2\n\n";

    fn read_all(raw: Vec<u8>) -> (Compression, Vec<u8>) {
        let mut source =
            DumpSource::from_reader(Path::new("test"), Box::new(std::io::Cursor::new(raw)))
                .unwrap();
        let mut out = Vec::new();
        source.stream().read_to_end(&mut out).unwrap();
        (source.compression(), out)
    }

    #[test]
    fn test_plain() {
        assert_eq!(read_all(DATA.to_vec()), (Compression::None, DATA.to_vec()));
    }

    #[test]
    fn test_short_plain() {
        assert_eq!(read_all(b"SV".to_vec()), (Compression::None, b"SV".to_vec()));
        assert_eq!(read_all(Vec::new()), (Compression::None, Vec::new()));
    }

    #[test]
    fn test_gzip() {
        let mut encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::fast());
        encoder.write_all(DATA).unwrap();
        let compressed = encoder.finish().unwrap();
        assert_eq!(read_all(compressed), (Compression::Gzip, DATA.to_vec()));
    }

    #[test]
    fn test_zstd() {
        let compressed = zstd::stream::encode_all(DATA, 1).unwrap();
        assert_eq!(read_all(compressed), (Compression::Zstd, DATA.to_vec()));
    }

    #[test]
    fn test_lz4() {
        let mut encoder = lz4_flex::frame::FrameEncoder::new(Vec::new());
        encoder.write_all(DATA).unwrap();
        let compressed = encoder.finish().unwrap();
        assert_eq!(read_all(compressed), (Compression::Lz4, DATA.to_vec()));
    }
}

// svndiff format described in
// https://svn.apache.org/repos/asf/subversion/trunk/notes/svndiff

use std::io::Read as _;

/// Maximum target length of the windows produced from full texts.
pub(crate) const WINDOW_SIZE: usize = 100 * 1024;

#[derive(Debug)]
pub(crate) enum DeltaError {
    Io(std::io::Error),
    InvalidDeltaHeader,
    UnsupportedVersion(u8),
    InvalidVarLenInt,
    OffsetTooLarge,
    LenTooLarge,
    BrokenCompression,
    SourceViewOutOfBounds {
        source_len: usize,
        view_offset: u64,
        view_len: usize,
    },
    TruncatedInstrs,
    NotEnoughNewData,
    InvalidInstr,
    CopyOutOfBounds,
    MismatchedTargetLen,
}

impl From<std::io::Error> for DeltaError {
    #[inline]
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

impl std::fmt::Display for DeltaError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match *self {
            Self::Io(ref e) => write!(f, "failed to read delta: {e}"),
            Self::InvalidDeltaHeader => write!(f, "invalid delta header"),
            Self::UnsupportedVersion(v) => write!(f, "unsupported svndiff version {v}"),
            Self::InvalidVarLenInt => write!(f, "invalid variable-length integer"),
            Self::OffsetTooLarge => write!(f, "offset too large"),
            Self::LenTooLarge => write!(f, "length too large"),
            Self::BrokenCompression => write!(f, "broken compressed delta section"),
            Self::SourceViewOutOfBounds {
                source_len,
                view_offset,
                view_len,
            } => write!(
                f,
                "source view with offset {view_offset} and length {view_len} out of bounds, source length is {source_len}",
            ),
            Self::TruncatedInstrs => write!(f, "truncated instructions"),
            Self::NotEnoughNewData => write!(f, "not enough new data"),
            Self::InvalidInstr => write!(f, "invalid instruction"),
            Self::CopyOutOfBounds => write!(f, "copy out of bounds"),
            Self::MismatchedTargetLen => write!(f, "mismatched target length"),
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum Instruction {
    /// Copy from the source view.
    Source { offset: usize, len: usize },
    /// Copy from the part of the target view already produced.
    Target { offset: usize, len: usize },
    /// Copy from the window's new data.
    NewData { len: usize },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct DeltaWindow {
    pub(crate) source_offset: u64,
    pub(crate) source_len: usize,
    pub(crate) target_len: usize,
    pub(crate) instructions: Vec<Instruction>,
    pub(crate) new_data: Vec<u8>,
}

impl DeltaWindow {
    /// A window that reproduces `data` without reading from its source.
    pub(crate) fn from_new_data(data: Vec<u8>) -> Self {
        let len = data.len();
        Self {
            source_offset: 0,
            source_len: 0,
            target_len: len,
            instructions: if len == 0 {
                Vec::new()
            } else {
                vec![Instruction::NewData { len }]
            },
            new_data: data,
        }
    }

    pub(crate) fn apply(
        &self,
        source: &[u8],
        dest: &mut dyn std::io::Write,
    ) -> Result<(), DeltaError> {
        let source_view = usize::try_from(self.source_offset)
            .ok()
            .and_then(|off| source.get(off..(off.checked_add(self.source_len)?)))
            .ok_or(DeltaError::SourceViewOutOfBounds {
                source_len: source.len(),
                view_offset: self.source_offset,
                view_len: self.source_len,
            })?;

        let mut target_buf = Vec::with_capacity(self.target_len);
        let mut new_data = self.new_data.as_slice();

        for instr in self.instructions.iter() {
            match *instr {
                Instruction::Source { offset, len } => {
                    let data = offset
                        .checked_add(len)
                        .and_then(|end| source_view.get(offset..end))
                        .ok_or(DeltaError::CopyOutOfBounds)?;
                    target_buf.extend(data);
                }
                Instruction::Target { offset, len } => {
                    // may overlap with the data being produced
                    if offset >= target_buf.len() {
                        return Err(DeltaError::CopyOutOfBounds);
                    }
                    for i in 0..len {
                        target_buf.push(target_buf[offset + i]);
                    }
                }
                Instruction::NewData { len } => {
                    if len > new_data.len() {
                        return Err(DeltaError::NotEnoughNewData);
                    }
                    let copy_data;
                    (copy_data, new_data) = new_data.split_at(len);
                    target_buf.extend(copy_data);
                }
            }
        }

        if target_buf.len() != self.target_len {
            return Err(DeltaError::MismatchedTargetLen);
        }

        dest.write_all(&target_buf)?;
        Ok(())
    }
}

/// Splits a full text into windows against an empty source.
pub(crate) fn fulltext_windows<E: From<std::io::Error>>(
    text: &mut dyn std::io::Read,
    mut handle: impl FnMut(DeltaWindow) -> Result<(), E>,
) -> Result<(), E> {
    loop {
        let mut chunk = Vec::with_capacity(WINDOW_SIZE);
        (&mut *text)
            .take(WINDOW_SIZE as u64)
            .read_to_end(&mut chunk)?;
        if chunk.is_empty() {
            return Ok(());
        }
        let is_last = chunk.len() < WINDOW_SIZE;
        handle(DeltaWindow::from_new_data(chunk))?;
        if is_last {
            return Ok(());
        }
    }
}

/// Decodes an svndiff stream one window at a time.
pub(crate) struct WindowReader<R> {
    src: R,
    version: Option<u8>,
}

impl<R: std::io::Read> WindowReader<R> {
    pub(crate) fn new(src: R) -> Self {
        Self { src, version: None }
    }

    pub(crate) fn next_window(&mut self) -> Result<Option<DeltaWindow>, DeltaError> {
        let version = match self.version {
            Some(v) => v,
            None => {
                let mut header = [0; 4];
                self.src.read_exact(&mut header).map_err(|e| {
                    if e.kind() == std::io::ErrorKind::UnexpectedEof {
                        DeltaError::InvalidDeltaHeader
                    } else {
                        DeltaError::Io(e)
                    }
                })?;
                let version = header
                    .strip_prefix(b"SVN")
                    .and_then(|rem| rem.first().copied())
                    .ok_or(DeltaError::InvalidDeltaHeader)?;
                if version > 2 {
                    return Err(DeltaError::UnsupportedVersion(version));
                }
                self.version = Some(version);
                version
            }
        };

        let Some(source_view_off) = self.read_first_var_len_int()? else {
            return Ok(None);
        };
        let source_view_len = self.read_var_len_int()?;
        let target_view_len = self.read_var_len_int()?;
        let instrs_len = self.read_var_len_int()?;
        let new_data_len = self.read_var_len_int()?;

        let source_view_len =
            usize::try_from(source_view_len).map_err(|_| DeltaError::LenTooLarge)?;
        let target_view_len =
            usize::try_from(target_view_len).map_err(|_| DeltaError::LenTooLarge)?;

        let raw_instrs = self.read_section(instrs_len)?;
        let raw_new_data = self.read_section(new_data_len)?;
        let instrs = decode_section(version, raw_instrs)?;
        let new_data = decode_section(version, raw_new_data)?;

        let mut rem_instrs = instrs.as_slice();
        let mut instructions = Vec::new();
        while !rem_instrs.is_empty() {
            instructions.push(read_instruction(&mut rem_instrs)?);
        }

        Ok(Some(DeltaWindow {
            source_offset: source_view_off,
            source_len: source_view_len,
            target_len: target_view_len,
            instructions,
            new_data,
        }))
    }

    fn read_section(&mut self, len: u64) -> Result<Vec<u8>, DeltaError> {
        let len = usize::try_from(len).map_err(|_| DeltaError::LenTooLarge)?;
        let mut section = vec![0; len];
        self.src.read_exact(&mut section).map_err(|e| {
            if e.kind() == std::io::ErrorKind::UnexpectedEof {
                DeltaError::TruncatedInstrs
            } else {
                DeltaError::Io(e)
            }
        })?;
        Ok(section)
    }

    /// Like `read_var_len_int`, but a clean end of stream is not an error.
    fn read_first_var_len_int(&mut self) -> Result<Option<u64>, DeltaError> {
        let mut byte = [0];
        loop {
            match self.src.read(&mut byte) {
                Ok(0) => return Ok(None),
                Ok(_) => break,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
                Err(e) => return Err(DeltaError::Io(e)),
            }
        }
        if (byte[0] & 0x80) == 0 {
            return Ok(Some(u64::from(byte[0])));
        }
        let mut value = u64::from(byte[0] & 0x7F);
        loop {
            self.src.read_exact(&mut byte)?;
            value = push_var_len_byte(value, byte[0])?;
            if (byte[0] & 0x80) == 0 {
                return Ok(Some(value));
            }
        }
    }

    fn read_var_len_int(&mut self) -> Result<u64, DeltaError> {
        let mut value = 0;
        loop {
            let mut byte = [0];
            self.src.read_exact(&mut byte).map_err(|e| {
                if e.kind() == std::io::ErrorKind::UnexpectedEof {
                    DeltaError::InvalidVarLenInt
                } else {
                    DeltaError::Io(e)
                }
            })?;
            value = push_var_len_byte(value, byte[0])?;
            if (byte[0] & 0x80) == 0 {
                return Ok(value);
            }
        }
    }
}

#[inline]
fn push_var_len_byte(value: u64, byte: u8) -> Result<u64, DeltaError> {
    if value > (u64::MAX >> 7) {
        return Err(DeltaError::InvalidVarLenInt);
    }
    Ok((value << 7) | u64::from(byte & 0x7F))
}

fn read_var_len_int(src: &mut &[u8]) -> Result<u64, DeltaError> {
    let mut value = 0;
    loop {
        let byte;
        (byte, *src) = src.split_first().ok_or(DeltaError::InvalidVarLenInt)?;
        value = push_var_len_byte(value, *byte)?;
        if (byte & 0x80) == 0 {
            return Ok(value);
        }
    }
}

/// Version 0 sections are stored as-is. Versions 1 (zlib) and 2 (lz4)
/// prefix each section with its decoded length and store it uncompressed
/// when compression would not help.
fn decode_section(version: u8, raw: Vec<u8>) -> Result<Vec<u8>, DeltaError> {
    if version == 0 {
        return Ok(raw);
    }

    let mut rem = raw.as_slice();
    let orig_len = read_var_len_int(&mut rem)?;
    let orig_len = usize::try_from(orig_len).map_err(|_| DeltaError::LenTooLarge)?;
    if rem.len() == orig_len {
        return Ok(rem.to_vec());
    }

    let decoded = match version {
        1 => {
            let mut decoded = Vec::with_capacity(orig_len);
            flate2::read::ZlibDecoder::new(rem)
                .read_to_end(&mut decoded)
                .map_err(|_| DeltaError::BrokenCompression)?;
            decoded
        }
        2 => lz4_flex::block::decompress(rem, orig_len)
            .map_err(|_| DeltaError::BrokenCompression)?,
        _ => unreachable!(),
    };

    if decoded.len() != orig_len {
        return Err(DeltaError::BrokenCompression);
    }
    Ok(decoded)
}

fn read_instruction(src: &mut &[u8]) -> Result<Instruction, DeltaError> {
    let first_byte;
    (first_byte, *src) = src.split_first().ok_or(DeltaError::TruncatedInstrs)?;

    let len = if (first_byte & 0x3F) != 0 {
        u64::from(first_byte & 0x3F)
    } else {
        read_var_len_int(src)?
    };
    let len = usize::try_from(len).map_err(|_| DeltaError::LenTooLarge)?;

    match first_byte >> 6 {
        0b00 => {
            let offset = read_var_len_int(src)?;
            let offset = usize::try_from(offset).map_err(|_| DeltaError::OffsetTooLarge)?;
            Ok(Instruction::Source { offset, len })
        }
        0b01 => {
            let offset = read_var_len_int(src)?;
            let offset = usize::try_from(offset).map_err(|_| DeltaError::OffsetTooLarge)?;
            Ok(Instruction::Target { offset, len })
        }
        0b10 => Ok(Instruction::NewData { len }),
        _ => Err(DeltaError::InvalidInstr),
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write as _;

    use super::{DeltaError, DeltaWindow, Instruction, WINDOW_SIZE, WindowReader, fulltext_windows};

    // Example from the svndiff format notes
    const SAMPLE_DELTA_WINDOW: &[u8] = &[
        0x00, // source view offset 0
        0x0C, // source view length 12
        0x10, // target view length 16
        0x07, // instructions length 7
        0x01, // new data length 1
        0x04, 0x00, // source, length 4, offset 0
        0x04, 0x08, // source, length 4, offset 8
        0x81, // new, length 1
        0x47, 0x08, // target, length 7, offset 8
        b'd', // new data 'd'
    ];

    fn apply_all(delta: &[u8], source: &[u8]) -> Vec<u8> {
        let mut reader = WindowReader::new(delta);
        let mut target = Vec::new();
        while let Some(window) = reader.next_window().unwrap() {
            window.apply(source, &mut target).unwrap();
        }
        target
    }

    #[test]
    fn test_apply() {
        let mut delta = b"SVN\0".to_vec();
        delta.extend(SAMPLE_DELTA_WINDOW);

        let mut reader = WindowReader::new(delta.as_slice());
        let window = reader.next_window().unwrap().unwrap();
        assert_eq!(
            window.instructions,
            [
                Instruction::Source { offset: 0, len: 4 },
                Instruction::Source { offset: 8, len: 4 },
                Instruction::NewData { len: 1 },
                Instruction::Target { offset: 8, len: 7 },
            ],
        );
        assert!(reader.next_window().unwrap().is_none());

        assert_eq!(apply_all(&delta, b"aaaabbbbcccc"), b"aaaaccccdddddddd");
    }

    #[test]
    fn test_apply_svndiff1_uncompressed_sections() {
        // Sections too small to be worth compressing are stored raw, after
        // their length.
        let mut delta = b"SVN\x01".to_vec();
        delta.extend([0x00, 0x00, 0x02, 0x02, 0x03]);
        delta.extend([0x01, 0x82]); // instructions: new, length 2
        delta.extend([0x02, b'h', b'i']); // new data "hi"

        assert_eq!(apply_all(&delta, b""), b"hi");
    }

    #[test]
    fn test_apply_svndiff1_zlib_sections() {
        let new_data = vec![b'x'; 1000];
        let mut compressed = Vec::new();
        let mut encoder =
            flate2::write::ZlibEncoder::new(&mut compressed, flate2::Compression::default());
        encoder.write_all(&new_data).unwrap();
        encoder.finish().unwrap();

        // decoded length 3, then new, length 1000 (0x87 0x68)
        let instrs_section = [0x03, 0x80, 0x87, 0x68];
        let mut data_section = vec![0x87, 0x68];
        data_section.extend(&compressed);

        let mut delta = b"SVN\x01".to_vec();
        delta.extend([0x00, 0x00, 0x87, 0x68]);
        delta.push(u8::try_from(instrs_section.len()).unwrap());
        delta.extend(encode_var_len(data_section.len()));
        delta.extend(instrs_section);
        delta.extend(&data_section);

        assert_eq!(apply_all(&delta, b""), new_data);
    }

    fn encode_var_len(mut value: usize) -> Vec<u8> {
        let mut out = vec![u8::try_from(value & 0x7F).unwrap()];
        value >>= 7;
        while value != 0 {
            out.insert(0, 0x80 | u8::try_from(value & 0x7F).unwrap());
            value >>= 7;
        }
        out
    }

    #[test]
    fn test_invalid_header() {
        let mut reader = WindowReader::new(b"XYZ\0".as_slice());
        assert!(reader.next_window().is_err());

        let mut reader = WindowReader::new(b"SVN\x07".as_slice());
        assert!(reader.next_window().is_err());
    }

    #[test]
    fn test_source_view_out_of_bounds() {
        let window = DeltaWindow {
            source_offset: 4,
            source_len: 4,
            target_len: 4,
            instructions: vec![Instruction::Source { offset: 0, len: 4 }],
            new_data: Vec::new(),
        };
        let mut target = Vec::new();
        assert!(window.apply(b"abc", &mut target).is_err());
    }

    #[test]
    fn test_fulltext_windows() {
        let text = vec![b'z'; WINDOW_SIZE + 10];
        let mut windows = Vec::new();
        fulltext_windows(&mut text.as_slice(), |window| {
            windows.push(window);
            Ok::<_, DeltaError>(())
        })
        .unwrap();

        assert_eq!(windows.len(), 2);
        assert_eq!(windows[0].target_len, WINDOW_SIZE);
        assert_eq!(windows[1].target_len, 10);

        let mut target = Vec::new();
        for window in windows.iter() {
            window.apply(b"", &mut target).unwrap();
        }
        assert_eq!(target, text);
    }

    #[test]
    fn test_fulltext_windows_empty() {
        let mut windows = 0;
        fulltext_windows(&mut b"".as_slice(), |_| {
            windows += 1;
            Ok::<_, DeltaError>(())
        })
        .unwrap();
        assert_eq!(windows, 0);
    }
}

//! Tag compression with raw deflate.
//!
//! A table compresses tags with one strategy chosen when it is created. A
//! tag is only stored compressed if that makes it strictly smaller, so the
//! compressed flag on an item always means "inflate me".
//!
//! The codec state is allocated on first use and reset between calls, since
//! a table compresses and decompresses many small tags.

use miniz_oxide::deflate::core::{CompressorOxide, create_comp_flags_from_zip_params};
use miniz_oxide::deflate::stream::deflate;
use miniz_oxide::inflate::stream::{InflateState, inflate};
use miniz_oxide::{DataFormat, MZError, MZFlush, MZStatus};

/// Tags this short or shorter are never worth compressing.
pub const COMPRESS_MIN: usize = 4;

/// zlib's default level.
const DEFLATE_LEVEL: i32 = 6;

/// Negative window bits select a raw stream with a 32K window.
const RAW_WINDOW_BITS: i32 = -15;

/// Output chunk for inflate.
const INFLATE_CHUNK: usize = 8192;

/// How a table compresses its tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum CompressionStrategy {
    /// Store tags as given.
    NoCompression = 0,
    /// General-purpose deflate.
    #[default]
    Default = 1,
    /// Favour Huffman coding over string matching.
    Filtered = 2,
    /// Huffman coding only.
    HuffmanOnly = 3,
    /// Matches limited to run lengths.
    RunLength = 4,
}

impl CompressionStrategy {
    /// Parse a strategy name as used in configuration.
    #[must_use]
    pub fn parse(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "none" => Some(Self::NoCompression),
            "default" => Some(Self::Default),
            "filtered" => Some(Self::Filtered),
            "huffman" => Some(Self::HuffmanOnly),
            "rle" => Some(Self::RunLength),
            _ => None,
        }
    }

    /// Name accepted by [`CompressionStrategy::parse`].
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::NoCompression => "none",
            Self::Default => "default",
            Self::Filtered => "filtered",
            Self::HuffmanOnly => "huffman",
            Self::RunLength => "rle",
        }
    }

    /// Translate to the deflate codec's strategy constant.
    const fn codec_strategy(self) -> Option<i32> {
        use miniz_oxide::deflate::core::CompressionStrategy as Codec;
        match self {
            Self::NoCompression => None,
            Self::Default => Some(Codec::Default as i32),
            Self::Filtered => Some(Codec::Filtered as i32),
            Self::HuffmanOnly => Some(Codec::HuffmanOnly as i32),
            Self::RunLength => Some(Codec::RLE as i32),
        }
    }
}

impl TryFrom<u8> for CompressionStrategy {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::NoCompression),
            1 => Ok(Self::Default),
            2 => Ok(Self::Filtered),
            3 => Ok(Self::HuffmanOnly),
            4 => Ok(Self::RunLength),
            _ => Err(value),
        }
    }
}

/// Reusable deflate/inflate state for one table.
pub struct CompressionStream {
    strategy: CompressionStrategy,
    deflater: Option<Box<CompressorOxide>>,
    inflater: Option<Box<InflateState>>,
}

/// What one pass of inflate achieved.
enum InflateProgress {
    Finished,
    NeedInput,
}

impl CompressionStream {
    /// Create a stream; no codec state is allocated until first use.
    #[must_use]
    pub const fn new(strategy: CompressionStrategy) -> Self {
        Self {
            strategy,
            deflater: None,
            inflater: None,
        }
    }

    /// Compress `input`, returning the compressed bytes only if they are
    /// strictly shorter than the input.
    pub fn compress(&mut self, input: &[u8]) -> Result<Option<Vec<u8>>, CompressionError> {
        let Some(codec_strategy) = self.strategy.codec_strategy() else {
            return Ok(None);
        };
        if input.len() <= COMPRESS_MIN {
            return Ok(None);
        }

        let deflater = self.deflater.get_or_insert_with(|| {
            let flags =
                create_comp_flags_from_zip_params(DEFLATE_LEVEL, RAW_WINDOW_BITS, codec_strategy);
            Box::new(CompressorOxide::new(flags))
        });
        deflater.reset();

        let mut out = vec![0u8; input.len() - 1];
        let result = deflate(deflater, input, &mut out, MZFlush::Finish);
        match result.status {
            Ok(MZStatus::StreamEnd) => {
                out.truncate(result.bytes_written);
                Ok(Some(out))
            }
            // Output did not fit in len - 1 bytes.
            Ok(_) | Err(MZError::Buf) => Ok(None),
            Err(MZError::Mem) => Err(CompressionError::ResourceExhausted),
            Err(e) => Err(CompressionError::Corrupt(format!("deflate failed: {e:?}"))),
        }
    }

    /// Inflate a complete compressed tag.
    ///
    /// If the input runs out before the end of the stream, a 4-byte trailer
    /// holding the running Adler-32 of the output is fed once before giving
    /// up.
    pub fn decompress(&mut self, input: &[u8]) -> Result<Vec<u8>, CompressionError> {
        let mut out = Vec::with_capacity(input.len() + input.len() / 2);
        let mut checksum = adler2::Adler32::new();

        if matches!(
            self.inflate_into(input, &mut out, &mut checksum, true)?,
            InflateProgress::Finished
        ) {
            return Ok(out);
        }

        let trailer = checksum.checksum().to_be_bytes();
        match self.inflate_into(&trailer, &mut out, &mut checksum, false)? {
            InflateProgress::Finished => Ok(out),
            InflateProgress::NeedInput => Err(CompressionError::Corrupt(
                "compressed tag ended before the end of the deflate stream".to_string(),
            )),
        }
    }

    fn inflate_into(
        &mut self,
        mut input: &[u8],
        out: &mut Vec<u8>,
        checksum: &mut adler2::Adler32,
        fresh: bool,
    ) -> Result<InflateProgress, CompressionError> {
        let state = self
            .inflater
            .get_or_insert_with(|| InflateState::new_boxed(DataFormat::Raw));
        if fresh {
            state.reset(DataFormat::Raw);
        }

        let mut chunk = [0u8; INFLATE_CHUNK];
        loop {
            let result = inflate(state, input, &mut chunk, MZFlush::None);
            input = &input[result.bytes_consumed..];
            let produced = &chunk[..result.bytes_written];
            checksum.write_slice(produced);
            out.extend_from_slice(produced);

            match result.status {
                Ok(MZStatus::StreamEnd) => return Ok(InflateProgress::Finished),
                Ok(MZStatus::Ok) => {
                    if input.is_empty() && result.bytes_written == 0 {
                        return Ok(InflateProgress::NeedInput);
                    }
                }
                Err(MZError::Buf) if input.is_empty() => return Ok(InflateProgress::NeedInput),
                Err(MZError::Mem) => return Err(CompressionError::ResourceExhausted),
                Ok(MZStatus::NeedDict) | Err(_) => {
                    return Err(CompressionError::Corrupt(format!(
                        "inflate failed: {:?}",
                        result.status
                    )));
                }
            }
        }
    }
}

/// Errors from the compression codec.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompressionError {
    /// The compressed bytes are not a valid deflate stream.
    Corrupt(String),
    /// The codec could not allocate its state.
    ResourceExhausted,
}

impl std::fmt::Display for CompressionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Corrupt(msg) => write!(f, "corrupt compressed data: {msg}"),
            Self::ResourceExhausted => write!(f, "compression codec out of memory"),
        }
    }
}

impl std::error::Error for CompressionError {}

#[cfg(test)]
mod tests {
    use rand::rngs::StdRng;
    use rand::{RngCore, SeedableRng};

    use super::*;

    fn repetitive(len: usize) -> Vec<u8> {
        b"doc-list-0001 doc-list-0002 "
            .iter()
            .copied()
            .cycle()
            .take(len)
            .collect()
    }

    #[test]
    fn test_compress_roundtrip_all_strategies() {
        let input = repetitive(4000);
        for strategy in [
            CompressionStrategy::Default,
            CompressionStrategy::Filtered,
            CompressionStrategy::HuffmanOnly,
            CompressionStrategy::RunLength,
        ] {
            let mut stream = CompressionStream::new(strategy);
            let compressed = stream
                .compress(&input)
                .expect("compress")
                .expect("repetitive input should shrink");
            assert!(compressed.len() < input.len(), "{strategy:?}");
            let restored = stream.decompress(&compressed).expect("decompress");
            assert_eq!(restored, input, "{strategy:?}");
        }
    }

    #[test]
    fn test_incompressible_input_is_refused() {
        let mut rng = StdRng::seed_from_u64(7);
        let mut input = vec![0u8; 512];
        rng.fill_bytes(&mut input);

        let mut stream = CompressionStream::new(CompressionStrategy::Default);
        assert_eq!(stream.compress(&input).expect("compress"), None);
    }

    #[test]
    fn test_short_and_disabled_inputs_are_not_compressed() {
        let mut stream = CompressionStream::new(CompressionStrategy::Default);
        assert_eq!(stream.compress(b"").expect("empty"), None);
        assert_eq!(stream.compress(b"abcd").expect("short"), None);

        let mut none = CompressionStream::new(CompressionStrategy::NoCompression);
        assert_eq!(none.compress(&repetitive(1000)).expect("none"), None);
    }

    #[test]
    fn test_stream_reused_across_calls() {
        let mut stream = CompressionStream::new(CompressionStrategy::Default);
        for len in [100, 5000, 64, 20_000, 300] {
            let input = repetitive(len);
            let compressed = stream.compress(&input).expect("compress").expect("shrinks");
            assert_eq!(stream.decompress(&compressed).expect("decompress"), input);
        }
    }

    #[test]
    fn test_garbage_is_reported_corrupt() {
        let mut stream = CompressionStream::new(CompressionStrategy::Default);
        // Block type 3 is reserved in deflate.
        let result = stream.decompress(&[0xff, 0xff, 0xff, 0xff, 0xff]);
        assert!(matches!(result, Err(CompressionError::Corrupt(_))));
    }

    #[test]
    fn test_truncated_stream_is_reported_corrupt() {
        let mut stream = CompressionStream::new(CompressionStrategy::Default);
        let compressed = stream
            .compress(&repetitive(3000))
            .expect("compress")
            .expect("shrinks");
        let truncated = &compressed[..compressed.len() / 2];
        assert!(stream.decompress(truncated).is_err());
    }

    #[test]
    fn test_strategy_names_roundtrip() {
        for strategy in [
            CompressionStrategy::NoCompression,
            CompressionStrategy::Default,
            CompressionStrategy::Filtered,
            CompressionStrategy::HuffmanOnly,
            CompressionStrategy::RunLength,
        ] {
            assert_eq!(CompressionStrategy::parse(strategy.name()), Some(strategy));
            assert_eq!(CompressionStrategy::try_from(strategy as u8), Ok(strategy));
        }
        assert_eq!(CompressionStrategy::parse("zstd"), None);
    }
}

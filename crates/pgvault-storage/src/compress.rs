//! Streaming compression filters.
//!
//! One encoder/decoder pair per supported type, all exposed through the
//! uniform [`CompressWriter`]/[`CompressReader`] wrappers so the pipeline
//! composes them like any other filter.

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use lz4::{Decoder as Lz4Decoder, EncoderBuilder as Lz4EncoderBuilder};
use pgvault_common::{CompressionType, Error, Result};
use std::io::{self, Read, Write};

enum Encoder<W: Write> {
    None(W),
    Gzip(GzEncoder<W>),
    Zstd(zstd::stream::write::Encoder<'static, W>),
    Lz4(Box<lz4::Encoder<W>>),
}

/// Compressing writer. Bytes written are compressed into the inner writer;
/// [`CompressWriter::finish`] flushes the trailer and returns the inner
/// writer.
pub struct CompressWriter<W: Write> {
    encoder: Encoder<W>,
}

impl<W: Write> CompressWriter<W> {
    pub fn new(inner: W, compression: CompressionType, level: u32) -> Result<Self> {
        let encoder = match compression {
            CompressionType::None => Encoder::None(inner),
            CompressionType::Gzip => Encoder::Gzip(GzEncoder::new(inner, Compression::new(level))),
            CompressionType::Zstd => Encoder::Zstd(
                zstd::stream::write::Encoder::new(inner, level as i32)
                    .map_err(|e| Error::Compress(format!("zstd encoder: {e}")))?,
            ),
            CompressionType::Lz4 => Encoder::Lz4(Box::new(
                Lz4EncoderBuilder::new()
                    .level(level)
                    .build(inner)
                    .map_err(|e| Error::Compress(format!("lz4 encoder: {e}")))?,
            )),
        };

        Ok(CompressWriter { encoder })
    }

    pub fn finish(self) -> Result<W> {
        match self.encoder {
            Encoder::None(inner) => Ok(inner),
            Encoder::Gzip(encoder) => {
                encoder.finish().map_err(|e| Error::Compress(format!("gzip finish: {e}")))
            }
            Encoder::Zstd(encoder) => {
                encoder.finish().map_err(|e| Error::Compress(format!("zstd finish: {e}")))
            }
            Encoder::Lz4(encoder) => {
                let (inner, result) = encoder.finish();
                result.map_err(|e| Error::Compress(format!("lz4 finish: {e}")))?;
                Ok(inner)
            }
        }
    }
}

impl<W: Write> Write for CompressWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match &mut self.encoder {
            Encoder::None(inner) => inner.write(buf),
            Encoder::Gzip(encoder) => encoder.write(buf),
            Encoder::Zstd(encoder) => encoder.write(buf),
            Encoder::Lz4(encoder) => encoder.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match &mut self.encoder {
            Encoder::None(inner) => inner.flush(),
            Encoder::Gzip(encoder) => encoder.flush(),
            Encoder::Zstd(encoder) => encoder.flush(),
            Encoder::Lz4(encoder) => encoder.flush(),
        }
    }
}

enum Decoder<R: Read> {
    None(R),
    Gzip(Box<GzDecoder<R>>),
    Zstd(zstd::stream::read::Decoder<'static, io::BufReader<R>>),
    Lz4(Box<Lz4Decoder<R>>),
}

/// Decompressing reader, the inverse of [`CompressWriter`].
pub struct CompressReader<R: Read> {
    decoder: Decoder<R>,
}

impl<R: Read> CompressReader<R> {
    pub fn new(inner: R, compression: CompressionType) -> Result<Self> {
        let decoder = match compression {
            CompressionType::None => Decoder::None(inner),
            CompressionType::Gzip => Decoder::Gzip(Box::new(GzDecoder::new(inner))),
            CompressionType::Zstd => Decoder::Zstd(
                zstd::stream::read::Decoder::new(inner)
                    .map_err(|e| Error::Compress(format!("zstd decoder: {e}")))?,
            ),
            CompressionType::Lz4 => Decoder::Lz4(Box::new(
                Lz4Decoder::new(inner).map_err(|e| Error::Compress(format!("lz4 decoder: {e}")))?,
            )),
        };

        Ok(CompressReader { decoder })
    }
}

impl<R: Read> Read for CompressReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match &mut self.decoder {
            Decoder::None(inner) => inner.read(buf),
            Decoder::Gzip(decoder) => decoder.read(buf),
            Decoder::Zstd(decoder) => decoder.read(buf),
            Decoder::Lz4(decoder) => decoder.read(buf),
        }
    }
}

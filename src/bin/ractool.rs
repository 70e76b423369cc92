use std::fs::{self, File};
use std::io::{self, BufWriter, Read, Seek, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use rac::codec::lz4::Lz4Writer;
use rac::codec::zlib::ZlibWriter;
use rac::codec::zstd::ZstdWriter;
use rac::{
    ChunkReader, CodecWriter, IndexLocation, MmapSource, ReadAt, Reader, ReaderConfig, Writer,
    WriterConfig,
};

const DEFAULT_CCHUNK_SIZE: usize = 64 * 1024; // 64 KiB

#[derive(Parser)]
#[command(name = "ractool", version, about = "Random access compression tool")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Compress INPUT (or stdin) into a RAC container.
    Encode {
        input: Option<PathBuf>,
        #[arg(short = 'o', long = "output")]
        output: Option<PathBuf>,
        #[arg(long = "codec", value_enum, default_value_t = CodecArg::Zstd)]
        codec: CodecArg,
        #[arg(long = "cpagesize")]
        cpage_size: Option<u64>,
        /// Decompressed bytes per chunk. Excludes --cchunksize.
        #[arg(long = "dchunksize")]
        dchunk_size: Option<usize>,
        /// Target compressed bytes per chunk; the default is 65536 unless
        /// --dchunksize is given.
        #[arg(long = "cchunksize")]
        cchunk_size: Option<usize>,
        #[arg(long = "indexlocation", value_enum)]
        index_location: Option<IndexArg>,
        /// Shared dictionary resource; may be repeated.
        #[arg(long = "resource")]
        resources: Vec<PathBuf>,
        /// JSON writer configuration; flags take precedence.
        #[arg(long = "config")]
        config: Option<PathBuf>,
    },
    /// Decompress a container, or a DSpace range of it.
    Decode {
        input: Option<PathBuf>,
        #[arg(short = 'o', long = "output")]
        output: Option<PathBuf>,
        /// LO..HI or LO:HI; either bound may be omitted.
        #[arg(long = "drange")]
        drange: Option<String>,
        #[arg(long = "concurrency", default_value_t = 1)]
        concurrency: usize,
    },
    /// Print the chunk table.
    Inspect { input: PathBuf },
}

#[derive(Clone, Copy, ValueEnum)]
enum CodecArg {
    Zlib,
    Lz4,
    Zstd,
}

#[derive(Clone, Copy, ValueEnum)]
enum IndexArg {
    Start,
    End,
}

fn main() {
    env_logger::init();
    if let Err(err) = run() {
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Encode {
            input,
            output,
            codec,
            cpage_size,
            dchunk_size,
            cchunk_size,
            index_location,
            resources,
            config,
        } => {
            let mut config = match config {
                Some(path) => {
                    let text = fs::read_to_string(&path)
                        .with_context(|| format!("read config {}", path.display()))?;
                    serde_json::from_str(&text)
                        .with_context(|| format!("parse config {}", path.display()))?
                }
                None => WriterConfig {
                    index_location: IndexLocation::AtStart,
                    ..WriterConfig::default()
                },
            };
            if let Some(size) = cpage_size {
                config.cpage_size = size;
            }
            apply_chunk_sizes(&mut config, dchunk_size, cchunk_size)?;
            match index_location {
                Some(IndexArg::Start) => config.index_location = IndexLocation::AtStart,
                Some(IndexArg::End) => config.index_location = IndexLocation::AtEnd,
                None => {}
            }
            let resources = resources
                .iter()
                .map(|path| fs::read(path).with_context(|| format!("read {}", path.display())))
                .collect::<Result<Vec<_>>>()?;

            let mut input = open_input(input.as_deref())?;
            let output = open_output(output.as_deref())?;
            match codec {
                CodecArg::Zlib => {
                    encode(ZlibWriter::default(), &mut input, output, &config, resources)
                }
                CodecArg::Lz4 => encode(Lz4Writer, &mut input, output, &config, resources),
                CodecArg::Zstd => {
                    encode(ZstdWriter::default(), &mut input, output, &config, resources)
                }
            }
        }
        Commands::Decode {
            input,
            output,
            drange,
            concurrency,
        } => {
            let source = open_source(input.as_deref())?;
            let config = ReaderConfig {
                concurrency,
                ..ReaderConfig::default()
            };
            let mut reader = Reader::new(source, &config)?;
            if let Some(drange) = drange {
                let (lo, hi) = parse_drange(&drange)?;
                let hi = hi.unwrap_or(reader.decompressed_size()?);
                reader.seek_range(lo, hi)?;
            }
            let mut output = open_output(output.as_deref())?;
            io::copy(&mut reader, &mut output)?;
            output.flush()?;
            reader.close()?;
            Ok(())
        }
        Commands::Inspect { input } => {
            let source = open_source(Some(&input))?;
            let mut out = BufWriter::new(io::stdout());
            inspect(source, &mut out)?;
            out.flush()?;
            Ok(())
        }
    }
}

/// Index-at-start containers stage their compressed data in an anonymous
/// temporary file rather than in memory.
fn encode<C: CodecWriter>(
    codec: C,
    input: &mut dyn Read,
    output: Box<dyn Write>,
    config: &WriterConfig,
    resources: Vec<Vec<u8>>,
) -> Result<()> {
    match config.index_location {
        IndexLocation::AtStart => {
            let temp = tempfile::tempfile().context("create temporary file")?;
            let writer = Writer::with_temp_file(output, codec, temp, config)?;
            copy_and_finish(input, writer.with_resources(resources))
        }
        IndexLocation::AtEnd => {
            let writer = Writer::new(output, codec, config)?;
            copy_and_finish(input, writer.with_resources(resources))
        }
    }
}

fn copy_and_finish<C, T>(
    input: &mut dyn Read,
    mut writer: Writer<Box<dyn Write>, C, T>,
) -> Result<()>
where
    C: CodecWriter,
    T: Read + Write + Seek,
{
    let n = io::copy(input, &mut writer)?;
    let mut output = writer.finish()?;
    output.flush()?;
    log::info!("encoded {n} bytes");
    Ok(())
}

/// Flags replace the configured chunking. With no sizes anywhere, chunks
/// are cut at 64 KiB compressed.
fn apply_chunk_sizes(
    config: &mut WriterConfig,
    dchunk_size: Option<usize>,
    cchunk_size: Option<usize>,
) -> Result<()> {
    match (dchunk_size, cchunk_size) {
        (Some(_), Some(_)) => bail!("must specify none or one of --cchunksize or --dchunksize"),
        (Some(size), None) => {
            config.dchunk_size = size;
            config.cchunk_size = 0;
        }
        (None, Some(size)) => {
            config.cchunk_size = size;
            config.dchunk_size = 0;
        }
        (None, None) if config.dchunk_size == 0 && config.cchunk_size == 0 => {
            config.cchunk_size = DEFAULT_CCHUNK_SIZE;
        }
        (None, None) => {}
    }
    Ok(())
}

fn inspect(source: Arc<dyn ReadAt>, out: &mut dyn Write) -> Result<()> {
    let chunks = ChunkReader::new(source)?;
    writeln!(out, "compressed_size={}", chunks.compressed_size())?;
    writeln!(out, "decompressed_size={}", chunks.decompressed_size()?)?;
    for chunk in chunks {
        let chunk = chunk?;
        writeln!(
            out,
            "drange={:?} cprimary={:?} csecondary={:?} ctertiary={:?} codec={:?}",
            chunk.d_range, chunk.c_primary, chunk.c_secondary, chunk.c_tertiary, chunk.codec
        )?;
    }
    Ok(())
}

fn open_input(path: Option<&Path>) -> Result<Box<dyn Read>> {
    Ok(match path {
        Some(path) => {
            Box::new(File::open(path).with_context(|| format!("open {}", path.display()))?)
        }
        None => Box::new(io::stdin().lock()),
    })
}

fn open_output(path: Option<&Path>) -> Result<Box<dyn Write>> {
    Ok(match path {
        Some(path) => Box::new(BufWriter::new(
            File::create(path).with_context(|| format!("create {}", path.display()))?,
        )),
        None => Box::new(BufWriter::new(io::stdout().lock())),
    })
}

fn open_source(path: Option<&Path>) -> Result<Arc<dyn ReadAt>> {
    match path {
        Some(path) => {
            let source = MmapSource::open(path).with_context(|| format!("map {}", path.display()))?;
            Ok(Arc::new(source))
        }
        None => {
            let mut bytes = Vec::new();
            io::stdin().lock().read_to_end(&mut bytes)?;
            Ok(Arc::new(bytes))
        }
    }
}

/// Parses `LO..HI` or `LO:HI`. A missing LO means 0, a missing HI means the
/// end of the stream.
fn parse_drange(text: &str) -> Result<(u64, Option<u64>)> {
    let Some((lo, hi)) = text.split_once("..").or_else(|| text.split_once(':')) else {
        bail!("invalid drange {text:?}: expected LO..HI or LO:HI");
    };
    let lo = match lo.trim() {
        "" => 0,
        text => text.parse().with_context(|| format!("invalid drange start {text:?}"))?,
    };
    let hi = match hi.trim() {
        "" => None,
        text => Some(text.parse().with_context(|| format!("invalid drange end {text:?}"))?),
    };
    if hi.is_some_and(|hi| hi < lo) {
        bail!("invalid drange {text:?}: end before start");
    }
    Ok((lo, hi))
}

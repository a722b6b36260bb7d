//! vdkit CLI - compose and inspect sparse VMDK images.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{ArgAction, Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use tracing_subscriber::EnvFilter;
use vdkit_core::checksum::{to_hex, HashingWriter};
use vdkit_core::vmdk::{
    is_sparse_vmdk, SparseOptions, SparseVmdkBuilder, SparseVmdkImage, SparseVmdkReader,
    DEFAULT_GRAIN_SIZE, SECTOR_SIZE,
};
use vdkit_core::{BuiltStream, MmapSource, ReadAt};

/// Compose raw disk images into sparse VMDKs without copying them first.
#[derive(Parser)]
#[command(name = "vdkit")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Increase log verbosity (-v debug, -vv trace). RUST_LOG overrides.
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Convert a raw disk image to a monolithicSparse VMDK.
    Convert {
        /// Path to the raw disk image.
        raw_file: PathBuf,

        /// Output VMDK path. Defaults to the input with a .vmdk extension.
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Grain size in 512-byte sectors (power of two, at least 8).
        #[arg(long, default_value_t = DEFAULT_GRAIN_SIZE)]
        grain_size: u64,

        /// Disk adapter type recorded in the descriptor.
        #[arg(long, default_value = "ide")]
        adapter: String,

        /// Write buffer size in megabytes.
        #[arg(long, default_value = "1")]
        chunk_size: usize,

        /// Print the SHA-256 of the written image.
        #[arg(long)]
        sha256: bool,

        /// Suppress progress output.
        #[arg(short, long)]
        quiet: bool,
    },

    /// Show the extent layout a conversion would produce.
    Layout {
        /// Path to the raw disk image.
        raw_file: PathBuf,

        /// Grain size in 512-byte sectors.
        #[arg(long, default_value_t = DEFAULT_GRAIN_SIZE)]
        grain_size: u64,
    },

    /// Display the header and descriptor of a sparse VMDK.
    Inspect {
        /// Path to the VMDK file.
        vmdk_file: PathBuf,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match cli.command {
        Commands::Convert {
            raw_file,
            output,
            grain_size,
            adapter,
            chunk_size,
            sha256,
            quiet,
        } => {
            let output = output.unwrap_or_else(|| raw_file.with_extension("vmdk"));
            run_convert(
                &raw_file,
                &output,
                grain_size,
                &adapter,
                chunk_size,
                sha256,
                quiet,
            )?;
        }
        Commands::Layout {
            raw_file,
            grain_size,
        } => {
            show_layout(&raw_file, grain_size)?;
        }
        Commands::Inspect { vmdk_file } => {
            show_inspect(&vmdk_file)?;
        }
    }

    Ok(())
}

fn init_logging(verbose: u8) {
    let default_level = match verbose {
        0 => "warn",
        1 => "vdkit_core=debug,warn",
        _ => "vdkit_core=trace,debug",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn open_raw(raw_file: &Path) -> Result<Arc<dyn ReadAt>> {
    let source = MmapSource::open(raw_file)
        .with_context(|| format!("failed to open raw image {}", raw_file.display()))?;
    Ok(Arc::new(source))
}

fn compose(
    raw_file: &Path,
    options: SparseOptions,
) -> Result<(SparseVmdkImage, u64)> {
    let source = open_raw(raw_file)?;
    let source_size = source.size();
    let image = SparseVmdkBuilder::new(source, options)
        .build()
        .with_context(|| format!("failed to lay out {}", raw_file.display()))?;
    Ok((image, source_size))
}

fn run_convert(
    raw_file: &Path,
    output: &Path,
    grain_size: u64,
    adapter: &str,
    chunk_size_mb: usize,
    sha256: bool,
    quiet: bool,
) -> Result<()> {
    if output == raw_file {
        bail!("output path must differ from the input image");
    }
    if chunk_size_mb == 0 {
        bail!("chunk size must be at least 1 MB");
    }

    let filename = output
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "disk.vmdk".to_string());
    let options = SparseOptions::default()
        .with_grain_size(grain_size)
        .with_adapter_type(adapter)
        .with_filename(filename);

    let (image, source_size) = compose(raw_file, options)?;
    let layout = image.layout.clone();
    tracing::info!(
        input = %raw_file.display(),
        output = %output.display(),
        grains = layout.allocated_grains,
        "converting raw image"
    );
    let mut stream = image.stream;

    if !quiet {
        println!("Sparse VMDK Conversion");
        println!("----------------------");
        println!("Input:     {} ({})", raw_file.display(), format_bytes(source_size));
        println!("Output:    {}", output.display());
        println!(
            "Grains:    {} of {} allocated ({} each)",
            layout.allocated_grains,
            layout.total_grains,
            format_bytes(layout.grain_size * SECTOR_SIZE)
        );
        println!("Image:     {}", format_bytes(layout.image_length()));
        println!();
    }

    let progress_bar = if quiet {
        None
    } else {
        let pb = ProgressBar::new(stream.total_length());
        let style = ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{wide_bar:.cyan/blue}] {bytes}/{total_bytes} ({bytes_per_sec}, {eta})")?
            .progress_chars("#>-");
        pb.set_style(style);
        Some(pb)
    };

    let file = File::create(output)
        .with_context(|| format!("failed to create {}", output.display()))?;
    let mut writer = BufWriter::new(file);
    let chunk_size = chunk_size_mb * 1024 * 1024;

    let digest = if sha256 {
        let mut hashing = HashingWriter::new(&mut writer);
        write_stream(&mut stream, &mut hashing, chunk_size, progress_bar.as_ref())?;
        Some(to_hex(&hashing.finish().1))
    } else {
        write_stream(&mut stream, &mut writer, chunk_size, progress_bar.as_ref())?;
        None
    };
    writer
        .flush()
        .with_context(|| format!("failed to flush {}", output.display()))?;
    stream.finalize();

    if let Some(pb) = progress_bar {
        pb.finish_with_message("Complete!");
    }

    if let Some(digest) = &digest {
        if quiet {
            println!("{}", digest);
        } else {
            println!("SHA-256:   {}", digest);
        }
    }

    if !quiet {
        println!();
        println!("Conversion completed successfully: {}", output.display());
        if source_size > 0 {
            println!(
                "Output size: {} ({:.1}% of input)",
                format_bytes(layout.image_length()),
                (layout.image_length() as f64 / source_size as f64) * 100.0
            );
        }
    }

    Ok(())
}

fn write_stream<W: Write>(
    stream: &mut BuiltStream,
    writer: &mut W,
    chunk_size: usize,
    progress_bar: Option<&ProgressBar>,
) -> Result<u64> {
    let progress = |written: u64| {
        if let Some(pb) = progress_bar {
            pb.set_position(written);
        }
    };
    let written = stream
        .write_to(writer, chunk_size, Some(&progress))
        .context("failed to write image")?;
    Ok(written)
}

fn show_layout(raw_file: &Path, grain_size: u64) -> Result<()> {
    let options = SparseOptions::default().with_grain_size(grain_size);
    let (image, source_size) = compose(raw_file, options)?;
    let layout = &image.layout;

    println!("Image Layout");
    println!("============");
    println!();
    println!("Input:            {} ({})", raw_file.display(), format_bytes(source_size));
    println!("Capacity:         {} sectors", layout.capacity);
    println!("Grain size:       {} sectors", layout.grain_size);
    println!(
        "Grains:           {} total, {} allocated",
        layout.total_grains, layout.allocated_grains
    );
    println!("Grain tables:     {}", layout.num_grain_tables);
    println!("Grain directory:  sector {}", layout.gd_offset);
    println!("First grain:      sector {}", layout.overhead);
    println!("Image size:       {}", format_bytes(layout.image_length()));
    println!();

    println!("{:>16} {:>16} {:>12}  KIND", "START", "END", "LENGTH");
    for extent in image.stream.extents() {
        println!(
            "{:>16} {:>16} {:>12}  {}",
            extent.start(),
            extent.end(),
            format_bytes(extent.length()),
            extent.kind()
        );
    }

    Ok(())
}

fn show_inspect(vmdk_file: &Path) -> Result<()> {
    let source: Arc<dyn ReadAt> = Arc::new(
        MmapSource::open(vmdk_file)
            .with_context(|| format!("failed to open {}", vmdk_file.display()))?,
    );
    if !is_sparse_vmdk(source.as_ref())? {
        bail!("{} is not a hosted sparse VMDK", vmdk_file.display());
    }

    let reader = SparseVmdkReader::open(source)?;
    let header = reader.header();

    println!("Sparse VMDK");
    println!("===========");
    println!();
    println!("Version:          {}", header.version);
    println!("Flags:            0x{:08x}", header.flags);
    println!(
        "Capacity:         {} ({} sectors)",
        format_bytes(reader.capacity()),
        header.capacity
    );
    println!("Grain size:       {} sectors", header.grain_size);
    println!("Grain directory:  sector {}", header.gd_offset);
    println!("Overhead:         {} sectors", header.overhead);
    println!("Compressed:       {}", header.is_compressed());
    println!(
        "Allocated grains: {} of {}",
        reader.allocated_grains()?,
        header.total_grains()
    );
    println!();

    match reader.descriptor() {
        None => println!("Descriptor:       None"),
        Some(descriptor) => {
            println!("Descriptor:");
            println!("  Create type:    {}", descriptor.create_type);
            println!("  CID:            {:08x}", descriptor.cid);
            if let Some(adapter) = descriptor.adapter_type() {
                println!("  Adapter:        {}", adapter);
            }
            if let Some(geometry) = descriptor.geometry() {
                println!(
                    "  Geometry:       {}/{}/{} (C/H/S)",
                    geometry.cylinders, geometry.heads, geometry.sectors
                );
            }
            for (i, extent) in descriptor.extents.iter().enumerate() {
                println!("  Extent {}:       {}", i + 1, extent);
            }
        }
    }

    Ok(())
}

/// Format bytes as human-readable string.
fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;
    const TB: u64 = GB * 1024;

    if bytes >= TB {
        format!("{:.2} TB", bytes as f64 / TB as f64)
    } else if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

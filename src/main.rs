use clap::{Parser, Subcommand};
use std::io::Write;
use std::path::PathBuf;

use packfs::archive::ArchiveFile;
use packfs::builder::ArchiveBuilder;
use packfs::dir::ArchiveDir;
use packfs::header::Header;
use packfs::record::MetaType;

#[derive(Parser)]
#[command(name = "packfs", version = "1.0.0", about = "Pack archive tool")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Pack files into an archive
    Pack {
        #[arg(short, long)]
        output: PathBuf,
        /// Compress entries with LZO at this blocksize (bytes)
        #[arg(short = 'z', long)]
        lzo: Option<u16>,
        /// Store a file as the firmware image entry (with hash prefix)
        #[arg(long)]
        image: Option<PathBuf>,
        /// Meta records as key=value pairs
        #[arg(short, long)]
        meta: Vec<String>,
        #[arg(short, long, num_args = 0..)]
        input: Vec<PathBuf>,
    },
    /// List archive contents
    List { input: PathBuf },
    /// Show archive header details
    Info { input: PathBuf },
    /// Print one entry to stdout
    Cat { input: PathBuf, entry: String },
    /// Extract every entry into a directory
    Unpack {
        input: PathBuf,
        #[arg(short = 'C', long, default_value = ".")]
        output_dir: PathBuf,
    },
    /// Stream-verify the body hash (and image hashes with --full)
    Verify {
        input: PathBuf,
        #[arg(long)]
        full: bool,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    match Cli::parse().command {
        // ── Pack ─────────────────────────────────────────────────────────────
        Commands::Pack {
            output,
            lzo,
            image,
            meta,
            input,
        } => {
            let mut builder = ArchiveBuilder::new();

            for pair in &meta {
                let (key, value) = pair
                    .split_once('=')
                    .ok_or("meta must be key=value")?;
                builder.add_meta(key, MetaType::String, b"", value.as_bytes())?;
            }

            for path in &input {
                let data = std::fs::read(path)?;
                let name = path.file_name().unwrap_or_default().to_string_lossy();
                match lzo {
                    Some(blocksize) => builder.add_regular_lzo(&name, &data, blocksize)?,
                    None => builder.add_regular(&name, &data)?,
                }
                println!("  packed  {} ({} B)", path.display(), data.len());
            }

            if let Some(path) = &image {
                let data = std::fs::read(path)?;
                let name = path.file_name().unwrap_or_default().to_string_lossy();
                match lzo {
                    Some(blocksize) => builder.add_image_lzo(&name, &data, blocksize)?,
                    None => builder.add_image(&name, &data)?,
                }
                println!("  image   {} ({} B)", path.display(), data.len());
            }

            let bytes = builder.build()?;
            std::fs::write(&output, &bytes)?;
            println!("Created: {}  ({} B on disk)", output.display(), bytes.len());
        }

        // ── List ─────────────────────────────────────────────────────────────
        Commands::List { input } => {
            let mut file = ArchiveFile::open(&input, None)?;
            println!("{:<32} {:>10} {:>6}  Flags", "Path", "Stored", "Hash");
            for i in 0..file.index_count() {
                let entry = file.index_read(i)?;
                let mut flags = String::new();
                if entry.is_reg() {
                    flags.push('R');
                }
                if entry.is_img() {
                    flags.push('I');
                }
                if entry.is_lzo() {
                    flags.push('Z');
                }
                println!(
                    "{:<32} {:>10} {:>6}  {}",
                    entry.path(),
                    entry.length,
                    hex::encode(&entry.entry_hash[..3]),
                    flags
                );
            }
        }

        // ── Info ─────────────────────────────────────────────────────────────
        Commands::Info { input } => {
            let header = {
                let f = std::fs::File::open(&input)?;
                Header::read(f)?
            };
            let mut file = ArchiveFile::open(&input, None)?;
            let file_size = std::fs::metadata(&input)?.len();

            println!("── Pack archive ─────────────────────────────────────────");
            println!("  Path        {}", input.display());
            println!("  File size   {} B", file_size);
            println!("  Version     {}", header.version);
            println!("  Meta size   {} B ({} records)", header.meta_size, file.meta_count()?);
            println!("  Index size  {} B ({} entries)", header.index_size, header.entry_count());
            println!("  Body hash   {}", hex::encode(header.pack_hash));
            println!("  Index hash  {}", hex::encode(header.index_hash));

            for i in 0..file.meta_count()? {
                let (record, _desc, value) = file.meta_read(i)?;
                println!(
                    "  meta[{i}]  {} = {} ({:?})",
                    record.key(),
                    String::from_utf8_lossy(&value),
                    record.mtype
                );
            }
        }

        // ── Cat ──────────────────────────────────────────────────────────────
        Commands::Cat { input, entry } => {
            let mut file = ArchiveFile::open(&input, Some(&entry))?;
            let mut stdout = std::io::stdout().lock();
            let mut buf = [0u8; 4096];
            loop {
                let n = file.read(&mut buf)?;
                if n == 0 {
                    break;
                }
                stdout.write_all(&buf[..n])?;
            }
        }

        // ── Unpack ───────────────────────────────────────────────────────────
        Commands::Unpack { input, output_dir } => {
            if !output_dir.exists() {
                std::fs::create_dir_all(&output_dir)?;
            }
            let mut dir = ArchiveDir::open(&input)?;
            let mut count = 0usize;
            while let Some(dirent) = dir.read_next()? {
                let mut file = ArchiveFile::open(&input, Some(&dirent.name))?;
                let entry = file.current_entry()?;
                if entry.is_img() && !entry.is_lzo() {
                    // Skip the image-hash prefix; size is net of it already.
                    file.seek(packfs::HASH_SIZE as i64, packfs::Whence::Start)?;
                }
                let size = file.fstat()?.size as usize;
                let mut data = vec![0u8; size];
                let mut got = 0usize;
                while got < size {
                    let n = file.read(&mut data[got..])?;
                    if n == 0 {
                        break;
                    }
                    got += n;
                }
                let dest = output_dir.join(dirent.name.replace('/', "_"));
                std::fs::write(&dest, &data[..got])?;
                println!("  unpacked  {} ({} B)", dest.display(), got);
                count += 1;
            }
            println!("Unpacked {} file(s) to {}", count, output_dir.display());
        }

        // ── Verify ───────────────────────────────────────────────────────────
        Commands::Verify { input, full } => match packfs::verify_archive(&input, full) {
            Ok(()) => println!("OK: {}", input.display()),
            Err(e) => {
                println!("FAILED: {e}");
                std::process::exit(1);
            }
        },
    }

    Ok(())
}

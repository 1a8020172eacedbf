use aos::{decode_entry, encode_entry, AosArchive, AosEntry};
use clap::Parser;
use std::fs;
use std::path::Path;

#[derive(Parser, Debug)]
#[command(name = "aos")]
#[command(version, about = "AOS archive utility for LiLiM engine assets", long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Extract an AOS archive into a directory of decoded assets
    Extract {
        /// Path to the .aos archive
        input: String,

        /// Output root (a subdirectory named after the archive is created)
        output: String,

        /// Write raw entry bytes without script/image decoding
        #[arg(long)]
        nodecode: bool,

        /// Verbose output
        #[arg(short, long)]
        verbose: bool,
    },
    /// Decode a single extracted file (.scr, .abm or .msk)
    Decode {
        /// Path to the file to decode
        input: String,

        /// Output file, or output directory for multi-frame images
        output: String,

        /// Verbose output
        #[arg(short, long)]
        verbose: bool,
    },
    /// Pack a directory of assets back into an AOS archive
    Repack {
        /// Directory whose files become the archive entries
        input: String,

        /// Path of the .aos archive to write
        output: String,

        /// Store file bytes as-is without script encoding
        #[arg(long)]
        noencode: bool,

        /// Verbose output
        #[arg(short, long)]
        verbose: bool,
    },
    /// Encode a single file into its archive form (.txt -> .scr)
    Encode {
        /// Path to the file to encode
        input: String,

        /// Output file
        output: String,

        /// Verbose output
        #[arg(short, long)]
        verbose: bool,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let args = Args::parse();

    match args.command {
        Commands::Extract {
            input,
            output,
            nodecode,
            verbose,
        } => extract(&input, &output, nodecode, verbose)?,
        Commands::Decode {
            input,
            output,
            verbose,
        } => decode_file(&input, &output, verbose)?,
        Commands::Repack {
            input,
            output,
            noencode,
            verbose,
        } => repack(&input, &output, noencode, verbose)?,
        Commands::Encode {
            input,
            output,
            verbose,
        } => encode_file(&input, &output, verbose)?,
    }

    println!("Done.");
    Ok(())
}

fn extract(
    input: &str,
    output: &str,
    nodecode: bool,
    verbose: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let input_path = Path::new(input);
    if !input_path.exists() {
        eprintln!("Error: File not found: {}", input);
        std::process::exit(1);
    }

    let data = fs::read(input_path)?;
    if verbose {
        println!("Reading {} ({} bytes)...", input, data.len());
    }

    let archive = AosArchive::parse(&data)?;
    let stem = input_path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "archive".to_string());
    let out_dir = Path::new(output).join(&stem);
    fs::create_dir_all(&out_dir)?;

    println!("Extracting {} entries...", archive.entries.len());
    for entry in &archive.entries {
        let files = if nodecode {
            vec![(entry.name.clone(), entry.data.clone())]
        } else {
            decode_entry(&entry.name, &entry.data)?
        };
        for (name, bytes) in files {
            if verbose {
                println!("  {} ({} bytes)", name, bytes.len());
            }
            fs::write(out_dir.join(&name), bytes)?;
        }
    }

    Ok(())
}

fn decode_file(input: &str, output: &str, verbose: bool) -> Result<(), Box<dyn std::error::Error>> {
    let input_path = Path::new(input);
    if !input_path.exists() {
        eprintln!("Error: File not found: {}", input);
        std::process::exit(1);
    }

    let name = input_path
        .file_name()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let data = fs::read(input_path)?;
    let files = decode_entry(&name, &data)?;

    if files.len() == 1 {
        let (decoded_name, bytes) = &files[0];
        if verbose {
            println!("  {} -> {} ({} bytes)", name, decoded_name, bytes.len());
        }
        fs::write(output, bytes)?;
    } else {
        // Multi-frame image: the output path names a directory.
        fs::create_dir_all(output)?;
        for (decoded_name, bytes) in files {
            if verbose {
                println!("  {} ({} bytes)", decoded_name, bytes.len());
            }
            fs::write(Path::new(output).join(&decoded_name), bytes)?;
        }
    }

    Ok(())
}

fn repack(
    input: &str,
    output: &str,
    noencode: bool,
    verbose: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let input_path = Path::new(input);
    if !input_path.is_dir() {
        eprintln!("Error: Directory not found: {}", input);
        std::process::exit(1);
    }

    let dir_name = input_path
        .file_name()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "archive".to_string());
    let mut archive = AosArchive::new(&format!("{}.aos", dir_name));

    // Filesystem enumeration order is the archive order; the engine does
    // not care which that is, only that the index and the data region agree.
    for result in fs::read_dir(input_path)? {
        let dir_entry = result?;
        let path = dir_entry.path();
        if !path.is_file() {
            continue;
        }
        let name = path
            .file_name()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        let bytes = fs::read(&path)?;
        let (entry_name, data) = if noencode {
            (name, bytes)
        } else {
            encode_entry(&name, &bytes)
        };
        if verbose {
            println!("  Adding: {} ({} bytes)", entry_name, data.len());
        }
        archive.add_entry(AosEntry {
            name: entry_name,
            data,
        });
    }

    let data = archive.serialize()?;
    fs::write(output, data)?;
    println!("Packed {} entries to {}.", archive.entries.len(), output);

    Ok(())
}

fn encode_file(input: &str, output: &str, verbose: bool) -> Result<(), Box<dyn std::error::Error>> {
    let input_path = Path::new(input);
    if !input_path.exists() {
        eprintln!("Error: File not found: {}", input);
        std::process::exit(1);
    }

    let name = input_path
        .file_name()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let data = fs::read(input_path)?;
    let (encoded_name, bytes) = encode_entry(&name, &data);
    if verbose {
        println!("  {} -> {} ({} bytes)", name, encoded_name, bytes.len());
    }
    fs::write(output, bytes)?;

    Ok(())
}

use anyhow::{anyhow, Context, Result};
use blockhashdb::{create_hashdb, hashdb_settings, is_valid_hashdb, logging, ScanSession};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "blockhashdb")]
#[command(version, about = "Block-hash database for forensic media scans")]
struct Cli {
    /// Path to the database directory.
    #[arg(long)]
    db: PathBuf,

    /// Increase logging verbosity (use together with RUST_LOG for fine control).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create a new, empty database
    Create {
        /// File offset granularity in bytes
        #[arg(long, default_value_t = 512)]
        sector_size: u32,

        /// Size of the hashed blocks in bytes
        #[arg(long, default_value_t = 512)]
        block_size: u32,

        /// Maximum number of sources recorded per hash
        #[arg(long, default_value_t = 60)]
        max_id_offset_pairs: u32,

        /// Presence-filter key width in bits
        #[arg(long, default_value_t = 28)]
        hash_prefix_bits: u32,

        /// Presence-filter suffix width in bytes
        #[arg(long, default_value_t = 3)]
        hash_suffix_bytes: u32,
    },

    /// Print settings and store sizes
    Info,

    /// Look up one block hash (hex) and print its expanded JSON evidence
    Probe {
        /// Block hash in hex
        hash: String,
    },

    /// List stored block hashes with their counts
    Hashes,

    /// List sources with their metadata
    Sources,
}

fn main() {
    if let Err(e) = run() {
        eprintln!("{:#}", e);
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();
    logging::init(cli.verbose)?;

    let command_line: String = std::env::args().collect::<Vec<_>>().join(" ");
    let db_dir = &cli.db;

    match cli.cmd {
        Command::Create {
            sector_size,
            block_size,
            max_id_offset_pairs,
            hash_prefix_bits,
            hash_suffix_bytes,
        } => {
            create_hashdb(
                db_dir,
                sector_size,
                block_size,
                max_id_offset_pairs,
                hash_prefix_bits,
                hash_suffix_bytes,
                &command_line,
            )
            .with_context(|| format!("Failed to create database in {}", db_dir.display()))?;

            tracing::info!(db_dir = %db_dir.display(), "database created");
            Ok(())
        }

        Command::Info => {
            is_valid_hashdb(db_dir)
                .with_context(|| format!("Not a valid database: {}", db_dir.display()))?;

            let settings = hashdb_settings(db_dir)?;
            println!("{}", serde_json::to_string(&settings)?);

            let scan = ScanSession::open(db_dir)
                .with_context(|| format!("Failed to open database in {}", db_dir.display()))?;
            println!("{}", serde_json::to_string(&scan.sizes()?)?);
            Ok(())
        }

        Command::Probe { hash } => {
            let hash = hex::decode(hash.trim()).map_err(|_| anyhow!("hash must be hex"))?;

            let mut scan = ScanSession::open(db_dir)
                .with_context(|| format!("Failed to open database in {}", db_dir.display()))?;

            let expanded = scan.find_expanded_hash(&hash)?;
            if expanded.is_empty() {
                println!("not found");
            } else {
                println!("{expanded}");
            }
            Ok(())
        }

        Command::Hashes => {
            let scan = ScanSession::open(db_dir)
                .with_context(|| format!("Failed to open database in {}", db_dir.display()))?;

            let mut next = scan.hash_begin()?;
            while let Some(hash) = next {
                println!("{} {}", hex::encode(&hash), scan.find_hash_count(&hash)?);
                next = scan.hash_next(&hash)?;
            }
            Ok(())
        }

        Command::Sources => {
            let scan = ScanSession::open(db_dir)
                .with_context(|| format!("Failed to open database in {}", db_dir.display()))?;

            let mut next = scan.source_begin()?;
            while let Some(source_id) = next {
                let data = scan.find_source_data(source_id)?;
                println!(
                    "{} {} filesize={} file_type={} low_entropy_count={}",
                    source_id,
                    hex::encode(&data.file_binary_hash),
                    data.filesize,
                    data.file_type,
                    data.low_entropy_count
                );
                for (repository_name, filename) in scan.find_source_names(source_id)? {
                    println!("  {repository_name}/{filename}");
                }
                next = scan.source_next(source_id)?;
            }
            Ok(())
        }
    }
}

use clap::{Parser, Subcommand};
use std::fs;
use std::io::Write;
use std::path::PathBuf;

use tevd::{Disk, Handle, Payload, Skimmer, Utf8Lossy};

#[derive(Parser)]
#[command(name = "tevd")]
#[command(about = "The TEVD virtual disk CLI", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create an empty archive.
    Create {
        output: PathBuf,
        #[arg(short, long, default_value = "disk")]
        name: String,
        #[arg(short, long, default_value_t = 1 << 20)]
        capacity: u64,
    },
    /// List the archive tree.
    List {
        input: PathBuf,
    },
    /// Print archive-level information.
    Info {
        input: PathBuf,
    },
    /// Add a host file at the given archive path.
    Add {
        archive: PathBuf,
        dest: String,
        input: PathBuf,
        #[arg(long)]
        overwrite: bool,
    },
    /// Write a file's payload to stdout.
    Cat {
        archive: PathBuf,
        path: String,
    },
    /// Delete an entry by handle.
    Rm {
        archive: PathBuf,
        handle: Handle,
    },
    /// Rebuild directory child lists from the parent census.
    Repair {
        archive: PathBuf,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let cli = Cli::parse();
    match &cli.command {
        Commands::Create { output, name, capacity } => {
            let disk = Disk::new(*capacity, name.as_bytes());
            fs::write(output, disk.save()?)?;
            println!("Created {} ({} bytes used)", output.display(), disk.used_bytes());
        }
        Commands::List { input } => {
            let skimmer = Skimmer::open(input, Box::new(Utf8Lossy))?;
            list_dir(&skimmer, 0, "")?;
        }
        Commands::Info { input } => {
            let skimmer = Skimmer::open(input, Box::new(Utf8Lossy))?;
            println!("--- TEVD Archive Info ---");
            println!("Name:      {}", String::from_utf8_lossy(skimmer.disk_name()));
            println!("Capacity:  {}", skimmer.capacity());
            println!("Entries:   {}", skimmer.offsets().len());
            println!("Footer at: {}", skimmer.footer_position());
            println!("Read-only: {}", skimmer.is_read_only());
        }
        Commands::Add { archive, dest, input, overwrite } => {
            let data = fs::read(input)?;
            let mut skimmer = Skimmer::open(archive, Box::new(Utf8Lossy))?;
            let handle = skimmer.create_path(dest, &data, *overwrite)?;
            println!("Added {} as entry {}", dest, handle);
        }
        Commands::Cat { archive, path } => {
            let skimmer = Skimmer::open(archive, Box::new(Utf8Lossy))?;
            let handle = resolve(&skimmer, path)?.ok_or("path not found")?;
            let entry = skimmer.fetch(handle)?.ok_or("entry vanished")?;
            match entry.payload {
                Payload::File(data) => std::io::stdout().write_all(&data)?,
                Payload::CompressedFile { .. } => {
                    return Err("compressed payload; decode with an external codec".into())
                }
                _ => return Err("not a file".into()),
            }
        }
        Commands::Rm { archive, handle } => {
            let mut skimmer = Skimmer::open(archive, Box::new(Utf8Lossy))?;
            skimmer.delete(&[*handle])?;
            println!("Deleted entry {}", handle);
        }
        Commands::Repair { archive } => {
            let mut skimmer = Skimmer::open(archive, Box::new(Utf8Lossy))?;
            skimmer.rebuild_child_lists()?;
            println!("Rebuilt directory child lists");
        }
    }
    Ok(())
}

fn list_dir(skimmer: &Skimmer, dir: Handle, prefix: &str) -> tevd::Result<()> {
    let Some(entry) = skimmer.fetch(dir)? else { return Ok(()) };
    let Payload::Directory(children) = entry.payload else { return Ok(()) };
    for child in children {
        let Some(entry) = skimmer.fetch(child)? else { continue };
        let name = skimmer.display_name(&entry);
        match entry.payload {
            Payload::Directory(_) => {
                println!("{prefix}{name}/");
                list_dir(skimmer, child, &format!("{prefix}{name}/"))?;
            }
            Payload::File(ref data) => println!("{prefix}{name} ({} bytes)", data.len()),
            Payload::CompressedFile { uncompressed_len, .. } => {
                println!("{prefix}{name} ({uncompressed_len} bytes, compressed)")
            }
            Payload::Symlink(target) => println!("{prefix}{name} -> {target}"),
        }
    }
    Ok(())
}

/// Walk the tree segment by segment; the archive stores raw name bytes.
fn resolve(skimmer: &Skimmer, path: &str) -> tevd::Result<Option<Handle>> {
    let mut cursor: Handle = 0;
    for segment in path.split(['/', '\\']).filter(|s| !s.is_empty()) {
        let Some(entry) = skimmer.fetch(cursor)? else { return Ok(None) };
        let Payload::Directory(children) = entry.payload else { return Ok(None) };
        let mut next = None;
        for child in children {
            if let Some(e) = skimmer.fetch(child)? {
                if e.name == segment.as_bytes() {
                    next = Some(child);
                    break;
                }
            }
        }
        match next {
            Some(handle) => cursor = handle,
            None => return Ok(None),
        }
    }
    Ok(Some(cursor))
}

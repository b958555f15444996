#![deny(unsafe_code)]

use anyhow::{Context, Result, bail};
use clap::{ArgAction, Parser, Subcommand};
use rfs_alloc::{FormatOptions, OpenOptions, Ring};
use rfs_block::{MmapRegion, Region};
use rfs_core::{PathOps, RingFs};
use rfs_fuse::MountOptions;
use rfs_ondisk::NodeKind;
use rfs_repair::{CheckReport, CompactionReport, check_image, check_ring, compact};
use rfs_types::{MIN_REGION_SIZE, RFS_MAGIC};
use serde::Serialize;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use tracing::info;
use tracing_subscriber::EnvFilter;

// ── CLI definition ──────────────────────────────────────────────────────────

#[derive(Parser)]
#[command(name = "rfs", about = "RingFS: a ring-heap filesystem in a single file")]
struct Cli {
    /// Raise log verbosity: -v for info, -vv for debug (overrides RUST_LOG).
    #[arg(short, long, global = true, action = ArgAction::Count)]
    verbose: u8,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Format an image with a Root node and one Free node.
    Mkfs {
        /// Path to the image file.
        image: PathBuf,
        /// Resize (or create) the image to this many bytes first.
        #[arg(long)]
        size: Option<u64>,
        /// Overwrite an image that is already formatted.
        #[arg(short, long)]
        force: bool,
    },
    /// Check ring structure; exits 10-13 on a fault.
    Fsck {
        image: PathBuf,
        #[arg(long)]
        json: bool,
    },
    /// Move all free space to the end of the image.
    Defrag {
        image: PathBuf,
        #[arg(long)]
        json: bool,
    },
    /// List every node in ring order.
    Inspect {
        image: PathBuf,
        #[arg(long)]
        json: bool,
    },
    /// Mount an image via FUSE (blocks until unmounted).
    Mount {
        image: PathBuf,
        mountpoint: PathBuf,
        /// Allow other users to access the mount.
        #[arg(long)]
        allow_other: bool,
        #[arg(long)]
        read_only: bool,
    },
}

// ── Serializable outputs ────────────────────────────────────────────────────

#[derive(Debug)]
struct FormatSummary {
    image: PathBuf,
    region_size: u64,
    free_bytes: u64,
    uid: u32,
    gid: u32,
}

#[derive(Debug, Serialize)]
struct NodeLine {
    offset: u64,
    kind: Option<NodeKind>,
    size: u64,
    previous_size: u64,
    data_size: u64,
    name: String,
}

#[derive(Debug, Serialize)]
struct InspectOutput {
    region_size: u64,
    nodes: Vec<NodeLine>,
    free_nodes: u64,
    free_bytes: u64,
    reserved_nodes: u64,
    reserved_bytes: u64,
}

#[derive(Debug, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
enum DefragOutput {
    Refused { check: CheckReport },
    Compacted { report: CompactionReport },
}

// ── Main ────────────────────────────────────────────────────────────────────

fn main() {
    match run() {
        Ok(0) => {}
        Ok(code) => std::process::exit(code),
        Err(error) => {
            eprintln!("error: {error:#}");
            std::process::exit(1);
        }
    }
}

fn init_tracing(verbosity: u8) {
    let filter = match verbosity {
        0 => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        1 => EnvFilter::new("info"),
        _ => EnvFilter::new("debug"),
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

/// Returns the process exit status.
fn run() -> Result<i32> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match cli.command {
        Command::Mkfs { image, size, force } => {
            let summary = mkfs(&image, size, force)?;
            println!(
                "formatted {}: {} total, {} free, root owned by {}:{}",
                summary.image.display(),
                scale_size(summary.region_size),
                scale_size(summary.free_bytes),
                summary.uid,
                summary.gid
            );
            Ok(0)
        }
        Command::Fsck { image, json } => fsck(&image, json),
        Command::Defrag { image, json } => defrag(&image, json),
        Command::Inspect { image, json } => {
            let output = inspect(&image)?;
            if json {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&output).context("serialize output")?
                );
            } else {
                print_inspect(&output);
            }
            Ok(0)
        }
        Command::Mount {
            image,
            mountpoint,
            allow_other,
            read_only,
        } => {
            mount_cmd(&image, &mountpoint, allow_other, read_only)?;
            Ok(0)
        }
    }
}

// ── Commands ────────────────────────────────────────────────────────────────

fn has_signature(path: &Path) -> Result<bool> {
    let mut head = [0_u8; 2];
    let mut file = File::open(path).with_context(|| format!("open {}", path.display()))?;
    match file.read_exact(&mut head) {
        Ok(()) => Ok(u16::from_le_bytes(head) == RFS_MAGIC),
        Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => Ok(false),
        Err(err) => Err(err).with_context(|| format!("read {}", path.display())),
    }
}

/// Effective uid and gid of this process; the Root node is owned by them.
#[allow(unsafe_code)]
fn process_owner() -> (u32, u32) {
    // SAFETY: geteuid and getegid take no arguments and always succeed.
    unsafe { (libc::geteuid(), libc::getegid()) }
}

fn mkfs(image: &Path, size: Option<u64>, force: bool) -> Result<FormatSummary> {
    let region = match size {
        Some(size) => {
            if size < MIN_REGION_SIZE {
                bail!("size {size} is below the minimum of {MIN_REGION_SIZE} bytes");
            }
            // Check before resizing so a refused format leaves the file alone.
            if !force && image.exists() && has_signature(image)? {
                bail!(
                    "{} already holds a RingFS image; use --force to overwrite",
                    image.display()
                );
            }
            MmapRegion::create(image, size)
        }
        None => MmapRegion::open(image),
    }
    .with_context(|| format!("failed to map image: {}", image.display()))?;

    let (uid, gid) = process_owner();
    let options = FormatOptions { force, uid, gid };
    let ring = Ring::format(region, &options)
        .with_context(|| format!("failed to format {}", image.display()))?;
    let summary = FormatSummary {
        image: image.to_path_buf(),
        region_size: ring.len(),
        free_bytes: ring.total_bytes(NodeKind::Free)?,
        uid: options.uid,
        gid: options.gid,
    };
    ring.into_region().close()?;
    Ok(summary)
}

fn fsck(image: &Path, json: bool) -> Result<i32> {
    let region = MmapRegion::open_read_only(image)
        .with_context(|| format!("failed to map image: {}", image.display()))?;
    let report = check_image(region.bytes());
    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&report).context("serialize output")?
        );
    } else {
        println!("{}: {report}", image.display());
    }
    Ok(report.exit_code())
}

fn defrag(image: &Path, json: bool) -> Result<i32> {
    let region = MmapRegion::open(image)
        .with_context(|| format!("failed to map image: {}", image.display()))?;
    let mut ring = Ring::open(region, &OpenOptions::default())
        .with_context(|| format!("not a RingFS image: {}", image.display()))?;

    let check = check_ring(&ring);
    let (output, code) = if check.is_sound() {
        let report = compact(&mut ring).context("compaction failed")?;
        (DefragOutput::Compacted { report }, 0)
    } else {
        (DefragOutput::Refused { check }, 1)
    };
    ring.into_region().close()?;

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&output).context("serialize output")?
        );
    } else {
        match &output {
            DefragOutput::Compacted { report } => println!("{}: {report}", image.display()),
            DefragOutput::Refused { check } => {
                eprintln!("{}: not compacting an unsound ring: {check}", image.display());
            }
        }
    }
    Ok(code)
}

fn inspect(image: &Path) -> Result<InspectOutput> {
    let region = MmapRegion::open_read_only(image)
        .with_context(|| format!("failed to map image: {}", image.display()))?;
    let ring = Ring::open(region, &OpenOptions::default())
        .with_context(|| format!("not a RingFS image: {}", image.display()))?;

    let mut nodes = Vec::new();
    for entry in ring.nodes() {
        let (offset, header) = entry.context("ring walk failed; run `rfs fsck`")?;
        nodes.push(NodeLine {
            offset: offset.get(),
            kind: header.kind(),
            size: header.size,
            previous_size: header.previous_size,
            data_size: header.data_size,
            name: header.name_lossy(),
        });
    }
    Ok(InspectOutput {
        region_size: ring.len(),
        nodes,
        free_nodes: ring.count(NodeKind::Free)?,
        free_bytes: ring.total_bytes(NodeKind::Free)?,
        reserved_nodes: ring.count(NodeKind::Reserved)?,
        reserved_bytes: ring.total_bytes(NodeKind::Reserved)?,
    })
}

fn print_inspect(output: &InspectOutput) {
    println!("RingFS Inspector");
    println!("region_size: {}", scale_size(output.region_size));
    println!(
        "{:>12}  {:<8}  {:>12}  {:>12}  {:>12}  name",
        "offset", "type", "size", "prev_size", "data_size"
    );
    for node in &output.nodes {
        println!(
            "{:>12}  {:<8}  {:>12}  {:>12}  {:>12}  {}",
            node.offset,
            node.kind.map_or("?", NodeKind::name),
            node.size,
            node.previous_size,
            node.data_size,
            node.name
        );
    }
    println!(
        "free: {} nodes, {}; reserved: {} nodes, {}",
        output.free_nodes,
        scale_size(output.free_bytes),
        output.reserved_nodes,
        scale_size(output.reserved_bytes)
    );
}

fn mount_cmd(image: &Path, mountpoint: &Path, allow_other: bool, read_only: bool) -> Result<()> {
    let options = OpenOptions::default();
    let fs = if read_only {
        RingFs::open_image_read_only(image, &options)
    } else {
        RingFs::open_image(image, &options)
    }
    .with_context(|| format!("failed to open RingFS image: {}", image.display()))?;

    let stat = fs.statfs()?;
    info!(
        image = %image.display(),
        blocks = stat.blocks,
        files = stat.files,
        "opened image"
    );
    eprintln!(
        "Mounting RingFS image ({} files, {} free) at {}",
        stat.files,
        scale_size(stat.blocks_free.saturating_mul(u64::from(stat.block_size))),
        mountpoint.display()
    );

    let opts = MountOptions {
        read_only,
        allow_other,
        auto_unmount: true,
    };
    let fs_ops: Box<dyn PathOps> = Box::new(fs);
    rfs_fuse::mount(fs_ops, mountpoint, &opts)
        .with_context(|| format!("FUSE mount failed at {}", mountpoint.display()))?;
    Ok(())
}

// ── Formatting ──────────────────────────────────────────────────────────────

/// Render `bytes` in the largest unit whose text stays within seven
/// characters, counting up from KB. Falls back to plain bytes.
fn scale_size(bytes: u64) -> String {
    const UNITS: [(&str, u32); 5] = [("KB", 10), ("MB", 20), ("GB", 30), ("TB", 40), ("PB", 50)];
    for (unit, shift) in UNITS {
        let text = format!("{} {unit}", bytes >> shift);
        if text.len() <= 7 {
            return text;
        }
    }
    format!("{bytes} B")
}

#[cfg(test)]
mod tests {
    use super::*;
    use rfs_repair::FaultKind;
    use rfs_types::NODE_HEADER_SIZE_U64;

    #[test]
    fn scale_size_picks_shortest_unit() {
        assert_eq!(scale_size(0), "0 KB");
        assert_eq!(scale_size(2048), "2 KB");
        assert_eq!(scale_size(1024 * 1024), "1024 KB");
        assert_eq!(scale_size(10 * 1024 * 1024), "10 MB");
        assert_eq!(scale_size(8 << 50), "8 PB");
        assert_eq!(scale_size(u64::MAX), format!("{} B", u64::MAX));
    }

    #[test]
    fn cli_parses_subcommands() {
        let cli = Cli::try_parse_from(["rfs", "-vv", "mkfs", "img", "--size", "4096", "-f"])
            .expect("parse");
        assert_eq!(cli.verbose, 2);
        assert!(matches!(
            cli.command,
            Command::Mkfs {
                size: Some(4096),
                force: true,
                ..
            }
        ));
        let cli = Cli::try_parse_from(["rfs", "mount", "img", "/mnt", "--read-only"])
            .expect("parse");
        assert!(matches!(
            cli.command,
            Command::Mount {
                read_only: true,
                allow_other: false,
                ..
            }
        ));
        assert!(Cli::try_parse_from(["rfs", "fsck"]).is_err());
    }

    #[test]
    fn mkfs_then_inspect() {
        let dir = tempfile::tempdir().expect("tempdir");
        let image = dir.path().join("ring.img");
        let summary = mkfs(&image, Some(64 * 1024), false).expect("mkfs");
        assert_eq!(summary.region_size, 64 * 1024);
        assert_eq!(summary.free_bytes, 64 * 1024 - 2 * NODE_HEADER_SIZE_U64);

        let output = inspect(&image).expect("inspect");
        assert_eq!(output.nodes.len(), 2);
        assert_eq!(output.nodes[0].kind, Some(NodeKind::Root));
        assert_eq!(output.nodes[1].kind, Some(NodeKind::Free));
        assert_eq!(output.free_nodes, 1);
        assert_eq!(output.reserved_nodes, 0);

        let json = serde_json::to_value(&output).expect("json");
        assert_eq!(json["nodes"][0]["kind"], "root");
    }

    #[test]
    fn mkfs_root_is_owned_by_formatting_process() {
        let dir = tempfile::tempdir().expect("tempdir");
        let image = dir.path().join("ring.img");
        let summary = mkfs(&image, Some(8192), false).expect("mkfs");
        let (uid, gid) = process_owner();
        assert_eq!((summary.uid, summary.gid), (uid, gid));

        let region = MmapRegion::open_read_only(&image).expect("map");
        let ring = Ring::open(region, &OpenOptions::default()).expect("open");
        let root = ring.header(rfs_types::NodeOffset::ROOT).expect("root");
        assert_eq!((root.uid, root.gid), (uid, gid));
    }

    #[test]
    fn mkfs_refuses_formatted_image_without_force() {
        let dir = tempfile::tempdir().expect("tempdir");
        let image = dir.path().join("ring.img");
        mkfs(&image, Some(8192), false).expect("mkfs");
        assert!(mkfs(&image, Some(16384), false).is_err());
        assert_eq!(std::fs::metadata(&image).expect("stat").len(), 8192);
        assert!(mkfs(&image, None, false).is_err());
        assert!(mkfs(&image, None, true).is_ok());
        assert!(mkfs(&image, Some(100), true).is_err());
    }

    #[test]
    fn fsck_exit_codes() {
        let dir = tempfile::tempdir().expect("tempdir");
        let image = dir.path().join("ring.img");
        mkfs(&image, Some(8192), false).expect("mkfs");
        assert_eq!(fsck(&image, true).expect("fsck"), 0);

        let mut bytes = std::fs::read(&image).expect("read");
        // Signature of the Free node that follows Root.
        let at = usize::try_from(NODE_HEADER_SIZE_U64).expect("offset");
        bytes[at] ^= 0xFF;
        std::fs::write(&image, &bytes).expect("write");
        assert_eq!(
            fsck(&image, false).expect("fsck"),
            FaultKind::BadSignature.exit_code()
        );
        assert_eq!(defrag(&image, false).expect("defrag"), 1);
    }

    #[test]
    fn defrag_compacts_files() {
        let dir = tempfile::tempdir().expect("tempdir");
        let image = dir.path().join("ring.img");
        mkfs(&image, Some(64 * 1024), false).expect("mkfs");
        {
            let mut fs = RingFs::open_image(&image, &OpenOptions::default()).expect("open");
            fs.create(b"/a", 0o644, 0, 0).expect("a");
            fs.write(b"/a", 0, &[1; 300]).expect("write a");
            fs.create(b"/b", 0o644, 0, 0).expect("b");
            fs.write(b"/b", 0, &[2; 300]).expect("write b");
            fs.unlink(b"/a").expect("unlink");
            fs.into_ring().into_region().close().expect("close");
        }

        assert_eq!(defrag(&image, true).expect("defrag"), 0);
        let output = inspect(&image).expect("inspect");
        assert_eq!(output.free_nodes, 1);
        assert_eq!(output.nodes[1].name, "b");
        assert_eq!(output.nodes[2].kind, Some(NodeKind::Free));
        assert_eq!(fsck(&image, false).expect("fsck"), 0);
    }
}

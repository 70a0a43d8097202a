#![forbid(unsafe_code)]

use anyhow::{Context, Result, bail};
use nxf::{
    AttrType, CaseSensitivity, DevicePageCache, FileByteDevice, Lcn, PageCache, Volume,
    VolumeInfo, VolumeOptions,
};
use serde::Serialize;
use std::env;
use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Options are not fully recoverable from the boot sector (the growth quanta
/// live only in configuration), so they ride along next to the image.
const SIDECAR_SUFFIX: &str = ".nxf.json";

#[derive(Debug, Serialize)]
struct RunOutput {
    vcn: i64,
    lcn: String,
    clusters: i64,
    device_offset: Option<u64>,
}

#[derive(Debug, Serialize)]
struct RunlistOutput {
    record: u64,
    sequence: u16,
    resident: bool,
    allocated: i64,
    data: i64,
    initialized: i64,
    runs: Vec<RunOutput>,
}

fn main() {
    if let Err(error) = run() {
        eprintln!("error: {error:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let mut args = env::args().skip(1);
    let Some(command) = args.next() else {
        print_usage();
        return Ok(());
    };

    match command.as_str() {
        "mkimage" => {
            let (Some(path), Some(size)) = (args.next(), args.next()) else {
                bail!("mkimage requires <image-path> <size>");
            };
            let size = parse_size(&size)?;
            let remaining: Vec<String> = args.collect();
            let mut options = VolumeOptions::default();
            if let Some(value) = flag_value(&remaining, "--cluster-size") {
                options.cluster_size = value
                    .parse()
                    .with_context(|| format!("invalid cluster size: {value}"))?;
            }
            if let Some(value) = flag_value(&remaining, "--records") {
                options.initial_records = value
                    .parse()
                    .with_context(|| format!("invalid record count: {value}"))?;
            }
            let json = remaining.iter().any(|arg| arg == "--json");
            mkimage(Path::new(&path), size, &options, json)
        }
        "inspect" => {
            let Some(path) = args.next() else {
                bail!("inspect requires a path argument");
            };
            let json = args.any(|arg| arg == "--json");
            inspect(Path::new(&path), json)
        }
        "runlist" => {
            let (Some(path), Some(record)) = (args.next(), args.next()) else {
                bail!("runlist requires <image-path> <record>");
            };
            let record: u64 = record
                .parse()
                .with_context(|| format!("invalid record number: {record}"))?;
            let json = args.any(|arg| arg == "--json");
            runlist(Path::new(&path), record, json)
        }
        "--help" | "-h" | "help" => {
            print_usage();
            Ok(())
        }
        _ => {
            print_usage();
            bail!("unknown command: {command}")
        }
    }
}

fn print_usage() {
    println!("nxf-cli\n");
    println!("USAGE:");
    println!("  nxf-cli mkimage <image-path> <size>[K|M|G] [--cluster-size N] [--records N] [--json]");
    println!("  nxf-cli inspect <image-path> [--json]");
    println!("  nxf-cli runlist <image-path> <record> [--json]");
}

fn flag_value<'a>(args: &'a [String], flag: &str) -> Option<&'a str> {
    args.iter()
        .position(|arg| arg == flag)
        .and_then(|at| args.get(at + 1))
        .map(String::as_str)
}

/// Byte count with an optional binary `K`, `M` or `G` suffix.
fn parse_size(text: &str) -> Result<u64> {
    let (digits, shift) = match text.as_bytes().last() {
        Some(b'K' | b'k') => (&text[..text.len() - 1], 10),
        Some(b'M' | b'm') => (&text[..text.len() - 1], 20),
        Some(b'G' | b'g') => (&text[..text.len() - 1], 30),
        _ => (text, 0),
    };
    let value: u64 = digits
        .parse()
        .with_context(|| format!("invalid size: {text}"))?;
    value
        .checked_mul(1 << shift)
        .with_context(|| format!("size overflows: {text}"))
}

fn sidecar_path(image: &Path) -> PathBuf {
    let mut name = OsString::from(image.as_os_str());
    name.push(SIDECAR_SUFFIX);
    PathBuf::from(name)
}

fn load_options(image: &Path) -> Result<VolumeOptions> {
    let path = sidecar_path(image);
    if !path.exists() {
        return Ok(VolumeOptions::default());
    }
    let text =
        fs::read_to_string(&path).with_context(|| format!("read {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("parse {}", path.display()))
}

fn open_volume(image: &Path) -> Result<Volume> {
    let options = load_options(image)?;
    let device = FileByteDevice::open(image)
        .with_context(|| format!("failed to open image: {}", image.display()))?;
    let cache: Arc<dyn PageCache> = Arc::new(DevicePageCache::new(device));
    Volume::mount(cache, &options)
        .with_context(|| format!("failed to mount NXF volume in {}", image.display()))
}

fn mkimage(path: &Path, size: u64, options: &VolumeOptions, json: bool) -> Result<()> {
    let geometry = options
        .geometry(size)
        .context("options do not fit the requested size")?;
    let device = FileByteDevice::create(path, size)
        .with_context(|| format!("failed to create image: {}", path.display()))?;
    let cache: Arc<dyn PageCache> = Arc::new(DevicePageCache::new(device));
    let clusters = Arc::new(geometry.cluster_allocator()?);
    let volume = Volume::format(cache, clusters, options)
        .with_context(|| format!("failed to format {}", path.display()))?;
    volume.sync().context("sync image")?;

    let sidecar = sidecar_path(path);
    let text = serde_json::to_string_pretty(options).context("serialize options")?;
    fs::write(&sidecar, text).with_context(|| format!("write {}", sidecar.display()))?;
    print_info(&volume.info(), json)
}

fn inspect(path: &Path, json: bool) -> Result<()> {
    let volume = open_volume(path)?;
    print_info(&volume.info(), json)
}

fn print_info(info: &VolumeInfo, json: bool) -> Result<()> {
    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(info).context("serialize output")?
        );
        return Ok(());
    }
    let geometry = &info.geometry;
    println!("NXF Inspector");
    println!("cluster_size: {}", geometry.cluster_size.get());
    println!("record_size: {}", geometry.record_size);
    println!("total_clusters: {}", geometry.total_clusters);
    println!("free_clusters: {}", info.free_clusters);
    println!("mft_lcn: {}", geometry.mft_lcn);
    println!(
        "mft_zone: {}..{}",
        geometry.mft_zone.start, geometry.mft_zone.end
    );
    println!(
        "records: {} in use, {} initialized, {} allocated",
        info.records_in_use, info.initialized_records, info.allocated_records
    );
    for (lcn, clusters) in &info.mft_runs {
        println!("mft_run: lcn {lcn} x {clusters}");
    }
    if info.has_errors {
        println!("errors: volume needs an offline check");
    }
    Ok(())
}

fn runlist(path: &Path, record: u64, json: bool) -> Result<()> {
    let volume = open_volume(path)?;
    let reference = volume
        .checkout_record(record)
        .and_then(|locked| locked.reference())
        .with_context(|| format!("failed to read record {record}"))?;
    let data = volume
        .lookup_attribute(reference, AttrType::DATA, &[], CaseSensitivity::Sensitive)
        .with_context(|| format!("record {record} has no unnamed $DATA"))?;
    let sizes = data.sizes();

    let mut runs = Vec::new();
    if !sizes.resident {
        let cluster_bytes = volume.geometry().cluster_bytes();
        let mut vcn = 0_i64;
        loop {
            let offset = vcn.unsigned_abs() * cluster_bytes;
            let extent = volume
                .resolve_extent(&data, offset)
                .with_context(|| format!("failed to map vcn {vcn}"))?;
            if extent.lcn == Lcn::EndOfFile {
                break;
            }
            if extent.clusters <= 0 {
                bail!("vcn {vcn} maps to an empty run");
            }
            runs.push(RunOutput {
                vcn,
                lcn: extent.lcn.to_string(),
                clusters: extent.clusters,
                device_offset: extent.device_offset,
            });
            vcn += extent.clusters;
        }
    }
    let output = RunlistOutput {
        record,
        sequence: reference.sequence,
        resident: sizes.resident,
        allocated: sizes.allocated,
        data: sizes.data,
        initialized: sizes.initialized,
        runs,
    };

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&output).context("serialize output")?
        );
    } else {
        println!(
            "record {} (seq {}): allocated {} data {} initialized {}",
            output.record, output.sequence, output.allocated, output.data, output.initialized
        );
        if output.resident {
            println!("resident");
        }
        for run in &output.runs {
            println!("vcn {} -> lcn {} x {}", run.vcn, run.lcn, run.clusters);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sizes_take_binary_suffixes() {
        assert_eq!(parse_size("4096").expect("plain"), 4096);
        assert_eq!(parse_size("8K").expect("kib"), 8192);
        assert_eq!(parse_size("2m").expect("mib"), 2 * 1024 * 1024);
        assert_eq!(parse_size("1G").expect("gib"), 1 << 30);
        assert!(parse_size("").is_err());
        assert!(parse_size("M").is_err());
        assert!(parse_size("12X").is_err());
    }

    #[test]
    fn sidecar_sits_next_to_the_image() {
        assert_eq!(
            sidecar_path(Path::new("/tmp/vol.img")),
            PathBuf::from("/tmp/vol.img.nxf.json")
        );
    }

    #[test]
    fn image_round_trips_through_the_sidecar() {
        let dir = tempfile::tempdir().expect("tempdir");
        let image = dir.path().join("vol.img");
        let options = VolumeOptions {
            cluster_size: 512,
            initial_records: 32,
            ..VolumeOptions::default()
        };
        mkimage(&image, 2 * 1024 * 1024, &options, true).expect("mkimage");
        assert_eq!(load_options(&image).expect("sidecar"), options);

        let volume = open_volume(&image).expect("open");
        let info = volume.info();
        assert_eq!(info.geometry.cluster_size.get(), 512);
        assert_eq!(info.initialized_records, 32);
        assert!(!info.has_errors);
        runlist(&image, 0, true).expect("table runlist");
    }
}

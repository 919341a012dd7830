//! A file-backed block device served through `userspd`
//!
//! Reference client showing how a backend wires up [`userspd::StorageUnit`] against the real
//! kernel transport: open the device, provision a logical unit backed by a plain file, and let
//! the dispatcher pool run until interrupted.

use std::fs::OpenOptions;
use std::os::unix::fs::FileExt;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use clap::{Arg, ArgAction, Command, crate_version};
use log::{LevelFilter, error, info};

use userspd::config::DispatcherConfig;
use userspd::context::OperationContext;
use userspd::guard::Guard;
use userspd::interface::{Completion, StorageUnitInterface};
use userspd::params::{Guid, ProductId, ProductRevisionLevel, StorageUnitParams};
use userspd::sense;
use userspd::transport::KernelTransport;
use userspd::unit::StorageUnit;
use userspd::wire::UnmapDescriptor;

/// Registered once `main` has opened the transport; `handle_interrupt` only touches this
/// through `Guard::execute`, which never blocks and never allocates beyond an `Arc` clone.
static SHUTDOWN: OnceLock<Guard<KernelTransport>> = OnceLock::new();

extern "C" fn handle_interrupt(_signum: libc::c_int) {
    if let Some(guard) = SHUTDOWN.get() {
        guard.execute();
    }
}

struct FileBackedDisk {
    file: Mutex<std::fs::File>,
    block_length: u32,
    write_protected: bool,
}

impl FileBackedDisk {
    fn offset(&self, lba: u64) -> u64 {
        lba * u64::from(self.block_length)
    }
}

impl StorageUnitInterface<KernelTransport> for FileBackedDisk {
    fn read(&self, _ctx: &OperationContext<KernelTransport>, lba: u64, block_count: u32) -> Completion {
        let len = block_count as usize * self.block_length as usize;
        let mut buf = vec![0u8; len];
        let file = self.file.lock().unwrap();
        match file.read_exact_at(&mut buf, self.offset(lba)) {
            Ok(()) => Completion::OkWithData(buf),
            Err(err) => {
                error!("read at lba {lba} failed: {err}");
                Completion::CheckCondition(sense::unrecovered_read_error(lba))
            }
        }
    }

    fn write(&self, _ctx: &OperationContext<KernelTransport>, lba: u64, data: &[u8]) -> Completion {
        if self.write_protected {
            return Completion::CheckCondition(sense::write_protected());
        }
        let file = self.file.lock().unwrap();
        match file.write_all_at(data, self.offset(lba)) {
            Ok(()) => Completion::Ok,
            Err(err) => {
                error!("write at lba {lba} failed: {err}");
                Completion::CheckCondition(sense::lba_out_of_range(lba))
            }
        }
    }

    fn flush(&self, _ctx: &OperationContext<KernelTransport>, _lba: u64, _block_count: u32) -> Completion {
        let file = self.file.lock().unwrap();
        match file.sync_data() {
            Ok(()) => Completion::Ok,
            Err(err) => {
                error!("flush failed: {err}");
                Completion::CheckCondition(sense::SenseData::new(
                    sense::key::HARDWARE_ERROR,
                    (0, 0),
                ))
            }
        }
    }

    fn unmap(&self, _ctx: &OperationContext<KernelTransport>, descriptors: &[UnmapDescriptor]) -> Completion {
        if self.write_protected {
            return Completion::CheckCondition(sense::write_protected());
        }
        let file = self.file.lock().unwrap();
        let zeros = vec![0u8; self.block_length as usize];
        for d in descriptors {
            for i in 0..d.block_count {
                if let Err(err) = file.write_all_at(&zeros, self.offset(d.lba + u64::from(i))) {
                    error!("unmap at lba {} failed: {err}", d.lba);
                    return Completion::CheckCondition(sense::lba_out_of_range(d.lba));
                }
            }
        }
        Completion::Ok
    }
}

fn guid_from_path(path: &std::path::Path) -> Guid {
    let digest = path.to_string_lossy().bytes().fold([0u8; 16], |mut acc, b| {
        for byte in acc.iter_mut() {
            *byte = byte.wrapping_add(b).rotate_left(1);
        }
        acc
    });
    Guid::from_bytes(digest)
}

fn main() {
    let matches = Command::new("rawdisk")
        .version(crate_version!())
        .arg(
            Arg::new("device")
                .long("device")
                .value_name("PATH")
                .default_value(userspd::transport::DEFAULT_DEVICE_PATH)
                .help("Kernel transport device to provision against"),
        )
        .arg(
            Arg::new("backing-file")
                .long("backing-file")
                .value_name("PATH")
                .required(true)
                .help("File used as the logical unit's backing store"),
        )
        .arg(
            Arg::new("block-count")
                .long("block-count")
                .value_name("COUNT")
                .default_value("131072")
                .help("Number of logical blocks"),
        )
        .arg(
            Arg::new("block-length")
                .long("block-length")
                .value_name("BYTES")
                .default_value("512")
                .help("Bytes per logical block"),
        )
        .arg(
            Arg::new("threads")
                .long("threads")
                .value_name("COUNT")
                .default_value("0")
                .help("Worker thread count; 0 derives one from host parallelism"),
        )
        .arg(
            Arg::new("write-protected")
                .long("write-protected")
                .action(ArgAction::SetTrue)
                .help("Reject Write and Unmap with WRITE PROTECTED"),
        )
        .arg(
            Arg::new("v")
                .short('v')
                .action(ArgAction::Count)
                .help("Sets the level of verbosity"),
        )
        .get_matches();

    let log_level = match matches.get_count("v") {
        0 => LevelFilter::Error,
        1 => LevelFilter::Warn,
        2 => LevelFilter::Info,
        3 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };
    env_logger::builder()
        .format_timestamp_nanos()
        .filter_level(log_level)
        .init();

    let backing_path = PathBuf::from(matches.get_one::<String>("backing-file").unwrap());
    let block_count: u64 = matches
        .get_one::<String>("block-count")
        .unwrap()
        .parse()
        .expect("--block-count must be a number");
    let block_length: u32 = matches
        .get_one::<String>("block-length")
        .unwrap()
        .parse()
        .expect("--block-length must be a number");
    let thread_count: usize = matches
        .get_one::<String>("threads")
        .unwrap()
        .parse()
        .expect("--threads must be a number");
    let write_protected = matches.get_flag("write-protected");

    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .open(&backing_path)
        .unwrap_or_else(|e| panic!("failed to open backing file {backing_path:?}: {e}"));
    file.set_len(block_count * u64::from(block_length))
        .unwrap_or_else(|e| panic!("failed to size backing file {backing_path:?}: {e}"));

    let params = StorageUnitParams {
        guid: guid_from_path(&backing_path),
        block_count,
        block_length,
        max_transfer_length: block_length * 2048,
        max_unmap_descriptor_count: 256,
        product_id: ProductId::new("rawdisk").unwrap(),
        product_revision_level: ProductRevisionLevel::new("1.0").unwrap(),
        write_protected,
        cache_supported: true,
        unmap_supported: true,
        eject_disabled: false,
    };

    let device_path = PathBuf::from(matches.get_one::<String>("device").unwrap());
    let transport = match KernelTransport::open(&device_path) {
        Ok(transport) => Arc::new(transport),
        Err(e) => {
            error!("failed to open transport device {device_path:?}: {e}");
            std::process::exit(2);
        }
    };

    let guard = SHUTDOWN.get_or_init(Guard::new);
    guard.set(Some(transport.clone()));
    unsafe {
        libc::signal(libc::SIGINT, handle_interrupt as libc::sighandler_t);
        libc::signal(libc::SIGTERM, handle_interrupt as libc::sighandler_t);
    }

    let backend = FileBackedDisk {
        file: Mutex::new(file),
        block_length,
        write_protected,
    };

    let config = DispatcherConfig {
        thread_count,
        transact_timeout: Duration::from_secs(30),
    };

    let unit = match StorageUnit::create(transport, &params, backend, config) {
        Ok(unit) => unit,
        Err(e) => {
            error!("failed to provision logical unit: {e}");
            std::process::exit(1);
        }
    };

    info!("serving {backing_path:?} as btl {}", unit.btl());
    loop {
        std::thread::sleep(Duration::from_secs(1));
        if let Some(code) = unit.dispatcher_error() {
            error!("dispatcher worker failed with code {code}, shutting down");
            break;
        }
    }
}

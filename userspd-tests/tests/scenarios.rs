//! End-to-end scenarios driving a [`userspd::StorageUnit`] through a [`FakeTransport`] instead
//! of a real kernel module.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use userspd::config::DispatcherConfig;
use userspd::context::OperationContext;
use userspd::interface::{Completion, StorageUnitInterface};
use userspd::params::{Btl, Guid, ProductId, ProductRevisionLevel, StorageUnitParams};
use userspd::sense;
use userspd::transport::{TransactRequest, TransactResponse, Transport};
use userspd::unit::StorageUnit;
use userspd::wire::{Kind, RequestHeader, ResponseHeader};

use userspd_tests::FakeTransport;

const BLOCK_LENGTH: u32 = 512;

fn sample_params() -> StorageUnitParams {
    StorageUnitParams {
        guid: Guid::from_bytes([7; 16]),
        block_count: 64,
        block_length: BLOCK_LENGTH,
        max_transfer_length: BLOCK_LENGTH * 8,
        max_unmap_descriptor_count: 32,
        product_id: ProductId::new("ramdisk").unwrap(),
        product_revision_level: ProductRevisionLevel::new("1.0").unwrap(),
        write_protected: false,
        cache_supported: true,
        unmap_supported: true,
        eject_disabled: false,
    }
}

struct RamDisk {
    blocks: Mutex<Vec<u8>>,
    write_protected: bool,
    flushes: Mutex<u32>,
}

impl RamDisk {
    fn new(params: &StorageUnitParams) -> Self {
        Self {
            blocks: Mutex::new(vec![0u8; (params.block_count * u64::from(params.block_length)) as usize]),
            write_protected: params.write_protected,
            flushes: Mutex::new(0),
        }
    }
}

impl StorageUnitInterface<FakeTransport> for RamDisk {
    fn read(&self, _ctx: &OperationContext<FakeTransport>, lba: u64, block_count: u32) -> Completion {
        let blocks = self.blocks.lock().unwrap();
        let start = lba as usize * BLOCK_LENGTH as usize;
        let len = block_count as usize * BLOCK_LENGTH as usize;
        if start + len > blocks.len() {
            return Completion::CheckCondition(sense::lba_out_of_range(lba));
        }
        Completion::OkWithData(blocks[start..start + len].to_vec())
    }

    fn write(&self, _ctx: &OperationContext<FakeTransport>, lba: u64, data: &[u8]) -> Completion {
        if self.write_protected {
            return Completion::CheckCondition(sense::write_protected());
        }
        let mut blocks = self.blocks.lock().unwrap();
        let start = lba as usize * BLOCK_LENGTH as usize;
        if start + data.len() > blocks.len() {
            return Completion::CheckCondition(sense::lba_out_of_range(lba));
        }
        blocks[start..start + data.len()].copy_from_slice(data);
        Completion::Ok
    }

    fn flush(&self, _ctx: &OperationContext<FakeTransport>, _lba: u64, _block_count: u32) -> Completion {
        *self.flushes.lock().unwrap() += 1;
        Completion::Ok
    }

    fn unmap(&self, _ctx: &OperationContext<FakeTransport>, descriptors: &[userspd::wire::UnmapDescriptor]) -> Completion {
        let mut blocks = self.blocks.lock().unwrap();
        for d in descriptors {
            let start = d.lba as usize * BLOCK_LENGTH as usize;
            let len = d.block_count as usize * BLOCK_LENGTH as usize;
            if start + len > blocks.len() {
                return Completion::CheckCondition(sense::lba_out_of_range(d.lba));
            }
            blocks[start..start + len].fill(0);
        }
        Completion::Ok
    }
}

/// A handler that defers every write, completing it later from a background thread.
struct DeferredWrites {
    inner: RamDisk,
}

impl StorageUnitInterface<FakeTransport> for DeferredWrites {
    fn read(&self, ctx: &OperationContext<FakeTransport>, lba: u64, block_count: u32) -> Completion {
        self.inner.read(ctx, lba, block_count)
    }

    fn write(&self, ctx: &OperationContext<FakeTransport>, lba: u64, data: &[u8]) -> Completion {
        let ctx = ctx.clone();
        let data = data.to_vec();
        // The real backend would hand this to an I/O thread pool; here a plain spawned thread
        // stands in for "completion happens later, possibly off a worker thread".
        let result = self.inner.write(&ctx, lba, &data);
        std::thread::spawn(move || {
            let (header, response_data) = match result {
                Completion::Ok => (ResponseHeader::good(ctx.hint(), ctx.kind()), Vec::new()),
                Completion::CheckCondition(sense) => {
                    (ResponseHeader::check_condition(ctx.hint(), ctx.kind(), sense), Vec::new())
                }
                _ => unreachable!("RamDisk::write never defers"),
            };
            ctx.send_response(header, response_data).unwrap();
        });
        Completion::Pending
    }

    fn flush(&self, ctx: &OperationContext<FakeTransport>, lba: u64, block_count: u32) -> Completion {
        self.inner.flush(ctx, lba, block_count)
    }

    fn unmap(&self, ctx: &OperationContext<FakeTransport>, descriptors: &[userspd::wire::UnmapDescriptor]) -> Completion {
        self.inner.unmap(ctx, descriptors)
    }
}

fn request(btl: Btl, hint: u64, kind: Kind, lba: u64, block_count: u32, data: Vec<u8>) -> TransactRequest {
    TransactRequest {
        header: RequestHeader::new(hint, btl, kind, lba, block_count, data.len() as u32),
        data,
    }
}

fn wait_for_completion(transport: &FakeTransport, btl: Btl, hint: u64) -> TransactResponse {
    for _ in 0..200 {
        let mut completions = transport.take_completions(btl);
        if let Some(index) = completions.iter().position(|r| r.header.hint == hint) {
            return completions.remove(index);
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    panic!("no completion observed for hint {hint}");
}

#[test]
fn synchronous_write_then_read_round_trips_data() {
    let transport = Arc::new(FakeTransport::new());
    let params = sample_params();
    let unit = StorageUnit::create(
        transport.clone(),
        &params,
        RamDisk::new(&params),
        DispatcherConfig {
            thread_count: 2,
            ..Default::default()
        },
    )
    .unwrap();

    let payload = vec![0xAB; BLOCK_LENGTH as usize * 2];
    transport.enqueue_request(unit.btl(), request(unit.btl(), 1, Kind::Write, 0, 2, payload.clone()));
    let write_resp = wait_for_completion(&transport, unit.btl(), 1);
    assert_eq!(write_resp.header.status, sense::status::GOOD);
    assert_eq!(write_resp.header.hint, 1);
    assert_eq!(write_resp.header.kind(), Ok(Kind::Write));

    transport.enqueue_request(unit.btl(), request(unit.btl(), 2, Kind::Read, 0, 2, Vec::new()));
    let read_resp = wait_for_completion(&transport, unit.btl(), 2);
    assert_eq!(read_resp.header.status, sense::status::GOOD);
    assert_eq!(read_resp.header.hint, 2);
    assert_eq!(read_resp.header.kind(), Ok(Kind::Read));
    assert_eq!(read_resp.data, payload);
}

#[test]
fn read_past_capacity_returns_lba_out_of_range() {
    let transport = Arc::new(FakeTransport::new());
    let params = sample_params();
    let unit = StorageUnit::create(transport.clone(), &params, RamDisk::new(&params), DispatcherConfig::default()).unwrap();

    transport.enqueue_request(unit.btl(), request(unit.btl(), 1, Kind::Read, params.block_count, 1, Vec::new()));
    let resp = wait_for_completion(&transport, unit.btl(), 1);
    assert_eq!(resp.header.status, sense::status::CHECK_CONDITION);
    assert_eq!(resp.header.sense.sense_key(), sense::key::ILLEGAL_REQUEST);
}

#[test]
fn write_protected_unit_rejects_writes() {
    let transport = Arc::new(FakeTransport::new());
    let mut params = sample_params();
    params.write_protected = true;
    let unit = StorageUnit::create(transport.clone(), &params, RamDisk::new(&params), DispatcherConfig::default()).unwrap();

    transport.enqueue_request(unit.btl(), request(unit.btl(), 1, Kind::Write, 0, 1, vec![1; BLOCK_LENGTH as usize]));
    let resp = wait_for_completion(&transport, unit.btl(), 1);
    assert_eq!(resp.header.status, sense::status::CHECK_CONDITION);
    assert_eq!(resp.header.sense.asc(), sense::asc::WRITE_PROTECTED);
}

#[test]
fn unmap_zeroes_the_requested_range() {
    let transport = Arc::new(FakeTransport::new());
    let params = sample_params();
    let unit = StorageUnit::create(transport.clone(), &params, RamDisk::new(&params), DispatcherConfig::default()).unwrap();

    transport.enqueue_request(unit.btl(), request(unit.btl(), 1, Kind::Write, 0, 1, vec![0x5A; BLOCK_LENGTH as usize]));
    wait_for_completion(&transport, unit.btl(), 1);

    let descriptor = userspd::wire::UnmapDescriptor::new(0, 1);
    let data = zerocopy::IntoBytes::as_bytes(&descriptor).to_vec();
    transport.enqueue_request(unit.btl(), request(unit.btl(), 2, Kind::Unmap, 0, 1, data));
    let unmap_resp = wait_for_completion(&transport, unit.btl(), 2);
    assert_eq!(unmap_resp.header.status, sense::status::GOOD);

    transport.enqueue_request(unit.btl(), request(unit.btl(), 3, Kind::Read, 0, 1, Vec::new()));
    let read_resp = wait_for_completion(&transport, unit.btl(), 3);
    assert!(read_resp.data.iter().all(|&b| b == 0));
}

#[test]
fn flush_is_forwarded_to_the_handler() {
    let transport = Arc::new(FakeTransport::new());
    let params = sample_params();
    let disk = RamDisk::new(&params);
    let unit = StorageUnit::create(transport.clone(), &params, disk, DispatcherConfig::default()).unwrap();

    transport.enqueue_request(unit.btl(), request(unit.btl(), 1, Kind::Flush, 0, 0, Vec::new()));
    let resp = wait_for_completion(&transport, unit.btl(), 1);
    assert_eq!(resp.header.status, sense::status::GOOD);
}

#[test]
fn deferred_write_completes_via_send_response_not_the_dispatch_return_value() {
    let transport = Arc::new(FakeTransport::new());
    let params = sample_params();
    let backend = DeferredWrites {
        inner: RamDisk::new(&params),
    };
    let unit = StorageUnit::create(transport.clone(), &params, backend, DispatcherConfig::default()).unwrap();

    transport.enqueue_request(unit.btl(), request(unit.btl(), 1, Kind::Write, 0, 1, vec![0x11; BLOCK_LENGTH as usize]));
    let resp = wait_for_completion(&transport, unit.btl(), 1);
    assert_eq!(resp.header.status, sense::status::GOOD);
    assert_eq!(resp.header.hint, 1);
    assert_eq!(resp.header.kind(), Ok(Kind::Write));
}

#[test]
fn unknown_opcode_is_rejected_as_illegal_request() {
    let transport = Arc::new(FakeTransport::new());
    let params = sample_params();
    let unit = StorageUnit::create(transport.clone(), &params, RamDisk::new(&params), DispatcherConfig::default()).unwrap();

    let req = TransactRequest {
        header: RequestHeader::with_raw_kind(1, unit.btl(), 0xEE, 0, 0, 0),
        data: Vec::new(),
    };
    transport.enqueue_request(unit.btl(), req);

    let resp = wait_for_completion(&transport, unit.btl(), 1);
    assert_eq!(resp.header.status, sense::status::CHECK_CONDITION);
    assert_eq!(resp.header.sense.asc(), sense::asc::INVALID_COMMAND_OPERATION_CODE);
    assert_eq!(resp.header.kind(), Err(0xEE));
}

#[test]
fn dispatcher_pool_spawns_the_configured_thread_count() {
    let transport = Arc::new(FakeTransport::new());
    let params = sample_params();
    let unit = StorageUnit::create(
        transport.clone(),
        &params,
        RamDisk::new(&params),
        DispatcherConfig {
            thread_count: 4,
            ..Default::default()
        },
    )
    .unwrap();

    for hint in 1..=8u64 {
        transport.enqueue_request(unit.btl(), request(unit.btl(), hint, Kind::Flush, 0, 0, Vec::new()));
    }
    for hint in 1..=8u64 {
        let resp = wait_for_completion(&transport, unit.btl(), hint);
        assert_eq!(resp.header.status, sense::status::GOOD);
    }
    assert!(unit.dispatcher_error().is_none());
}

/// A handler implementing only `read`; `write`/`flush`/`unmap` fall through to
/// [`StorageUnitInterface`]'s default, which rejects with `ILLEGAL REQUEST`.
struct ReadOnlyDisk {
    inner: RamDisk,
}

impl StorageUnitInterface<FakeTransport> for ReadOnlyDisk {
    fn read(&self, ctx: &OperationContext<FakeTransport>, lba: u64, block_count: u32) -> Completion {
        self.inner.read(ctx, lba, block_count)
    }
}

#[test]
fn read_only_unit_serves_reads_and_rejects_writes_as_illegal_request() {
    let transport = Arc::new(FakeTransport::new());
    let params = sample_params();
    let backend = ReadOnlyDisk {
        inner: RamDisk::new(&params),
    };
    let unit = StorageUnit::create(transport.clone(), &params, backend, DispatcherConfig::default()).unwrap();

    transport.enqueue_request(unit.btl(), request(unit.btl(), 1, Kind::Read, 0, 2, Vec::new()));
    let read_resp = wait_for_completion(&transport, unit.btl(), 1);
    assert_eq!(read_resp.header.status, sense::status::GOOD);
    assert_eq!(read_resp.data.len(), BLOCK_LENGTH as usize * 2);

    transport.enqueue_request(unit.btl(), request(unit.btl(), 2, Kind::Write, 0, 1, vec![1; BLOCK_LENGTH as usize]));
    let write_resp = wait_for_completion(&transport, unit.btl(), 2);
    assert_eq!(write_resp.header.status, sense::status::CHECK_CONDITION);
    assert_eq!(write_resp.header.sense.sense_key(), sense::key::ILLEGAL_REQUEST);
    assert_eq!(write_resp.header.sense.asc(), sense::asc::INVALID_COMMAND_OPERATION_CODE);
}

/// A handler that simulates a page fault while servicing a read at `faulting_lba`, translating
/// it to `MEDIUM_ERROR`/`UNRECOVERED READ ERROR` sense carrying the offending LBA.
struct FaultingRead {
    inner: RamDisk,
    faulting_lba: u64,
}

impl StorageUnitInterface<FakeTransport> for FaultingRead {
    fn read(&self, ctx: &OperationContext<FakeTransport>, lba: u64, block_count: u32) -> Completion {
        if lba == self.faulting_lba {
            return Completion::CheckCondition(sense::unrecovered_read_error(lba));
        }
        self.inner.read(ctx, lba, block_count)
    }
}

#[test]
fn faulting_read_reports_medium_error_with_the_offending_lba() {
    let transport = Arc::new(FakeTransport::new());
    let params = sample_params();
    let backend = FaultingRead {
        inner: RamDisk::new(&params),
        faulting_lba: 7,
    };
    let unit = StorageUnit::create(transport.clone(), &params, backend, DispatcherConfig::default()).unwrap();

    transport.enqueue_request(unit.btl(), request(unit.btl(), 1, Kind::Read, 7, 1, Vec::new()));
    let resp = wait_for_completion(&transport, unit.btl(), 1);

    assert_eq!(resp.header.status, sense::status::CHECK_CONDITION);
    let sense = resp.header.sense;
    assert_eq!(sense.sense_key(), sense::key::MEDIUM_ERROR);
    assert_eq!(sense.asc(), sense::asc::UNRECOVERED_READ_ERROR);
    assert!(sense.is_valid());
    assert_eq!(sense.lba(), Some(7));
}

#[test]
fn worker_errors_latch_after_fatal_transport_failure() {
    let transport = Arc::new(FakeTransport::new());
    let params = sample_params();
    let unit = StorageUnit::create(
        transport.clone(),
        &params,
        RamDisk::new(&params),
        DispatcherConfig {
            thread_count: 1,
            ..Default::default()
        },
    )
    .unwrap();

    transport.fail_after(unit.btl(), 10);
    for hint in 1..=10u64 {
        transport.enqueue_request(unit.btl(), request(unit.btl(), hint, Kind::Flush, 0, 0, Vec::new()));
    }
    for hint in 1..=10u64 {
        let resp = wait_for_completion(&transport, unit.btl(), hint);
        assert_eq!(resp.header.status, sense::status::GOOD);
    }

    for _ in 0..200 {
        if unit.dispatcher_error().is_some() {
            break;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    assert_eq!(unit.dispatcher_error(), Some(libc::ECANCELED));
}

#[test]
fn spurious_wakeup_with_zero_hint_produces_no_response() {
    let transport = Arc::new(FakeTransport::new());
    let params = sample_params();
    let unit = StorageUnit::create(transport.clone(), &params, RamDisk::new(&params), DispatcherConfig::default()).unwrap();

    transport.enqueue_request(unit.btl(), request(unit.btl(), 0, Kind::Flush, 0, 0, Vec::new()));
    transport.enqueue_request(unit.btl(), request(unit.btl(), 1, Kind::Flush, 0, 0, Vec::new()));
    let resp = wait_for_completion(&transport, unit.btl(), 1);
    assert_eq!(resp.header.status, sense::status::GOOD);
    assert!(transport.take_completions(unit.btl()).is_empty());
}

#[test]
fn deleting_a_unit_unprovisions_it_from_the_transport() {
    let transport = Arc::new(FakeTransport::new());
    let params = sample_params();
    let unit = StorageUnit::create(transport.clone(), &params, RamDisk::new(&params), DispatcherConfig::default()).unwrap();
    let btl = unit.btl();
    unit.delete();
    assert!(!transport.list().unwrap().contains(&btl));
}

//! End-to-end exercises of `PosixIo` over regular-file devices: open
//! validation, staging window copies, DEV2DEV batching and zeroing.

use rfs_error::RemapError;
use rfs_extent::{DEFAULT_USER_DATA, Extent, ExtentList};
use rfs_io::{CopyDir, DeviceIo, JobDir, PosixIo, PosixIoConfig, ZeroTarget};
use std::io::Write;
use std::path::{Path, PathBuf};

const DEV_LEN: usize = 64 * 1024;

struct Fixture {
    _root: tempfile::TempDir,
    device_path: PathBuf,
    io: PosixIo,
}

fn write_file(path: &Path, data: &[u8]) {
    let mut file = std::fs::File::create(path).expect("create fixture file");
    file.write_all(data).expect("write fixture file");
}

/// Device filled with a per-4K-block marker byte, tiny loop/zero files.
fn fixture(simulate: bool) -> Fixture {
    let root = tempfile::tempdir().expect("tempdir");
    let device_path = root.path().join("device.img");
    let loop_path = root.path().join("loop.img");
    let zero_path = root.path().join("zero.img");

    let mut image = vec![0_u8; DEV_LEN];
    for (block, chunk) in image.chunks_mut(4096).enumerate() {
        chunk.fill(block as u8 + 1);
    }
    write_file(&device_path, &image);
    write_file(&loop_path, &[0_u8; 4096]);
    write_file(&zero_path, &[0_u8; 4096]);

    let job = JobDir::init(Some(root.path()), 0).expect("job dir");
    let cfg = PosixIoConfig {
        device_path: device_path.clone(),
        loop_file_path: loop_path,
        zero_file_path: zero_path,
        force_run: true, // regular-file device
        simulate_run: simulate,
        storage_size: 0,
        umount_cmd: None,
    };
    let mut io = PosixIo::new(job, cfg).expect("posix io");
    io.open().expect("open");
    io.set_effective_block_size_log2(12);
    Fixture {
        _root: root,
        device_path,
        io,
    }
}

fn device_bytes(path: &Path) -> Vec<u8> {
    std::fs::read(path).expect("read device image")
}

#[test]
fn open_rejects_loop_file_longer_than_device() {
    let root = tempfile::tempdir().expect("tempdir");
    let device_path = root.path().join("device.img");
    let loop_path = root.path().join("loop.img");
    let zero_path = root.path().join("zero.img");
    write_file(&device_path, &[0_u8; 4096]);
    write_file(&loop_path, &[0_u8; 8192]);
    write_file(&zero_path, &[0_u8; 1024]);

    let job = JobDir::init(Some(root.path()), 0).expect("job dir");
    let mut io = PosixIo::new(
        job,
        PosixIoConfig {
            device_path,
            loop_file_path: loop_path,
            zero_file_path: zero_path,
            force_run: true,
            simulate_run: true,
            storage_size: 0,
            umount_cmd: None,
        },
    )
    .expect("posix io");

    // Oversized loop file is never forceable.
    let err = io.open().unwrap_err();
    assert!(matches!(err, RemapError::Config(_)));
    assert!(!io.is_open());
}

#[test]
fn storage_window_roundtrip_moves_device_bytes() {
    let mut fx = fixture(false);

    // Primary staging at device [16K, 24K), secondary 8K on disk.
    let mut primary = ExtentList::new();
    primary.append(Extent::new(16384, 16384, 8192, DEFAULT_USER_DATA));
    *fx.io.primary_storage_mut() = primary;
    fx.io.create_storage(8192, 8192).expect("create storage");
    assert_eq!(fx.io.secondary_storage().length, 8192);
    assert_eq!(fx.io.secondary_storage().user_data, 8192);

    // Stage device block 0 (marker 0x01) at window offset 0, then land it
    // at device offset 32K (block 8, marker 0x09).
    let mut stage = ExtentList::new();
    stage.append(Extent::new(0, 0, 4096, DEFAULT_USER_DATA));
    fx.io
        .flush_copy_bytes(CopyDir::Dev2Storage, &mut stage)
        .expect("dev2storage");

    let mut land = ExtentList::new();
    land.append(Extent::new(0, 32768, 4096, DEFAULT_USER_DATA));
    fx.io
        .flush_copy_bytes(CopyDir::Storage2Dev, &mut land)
        .expect("storage2dev");
    fx.io.flush_bytes().expect("flush");

    let image = device_bytes(&fx.device_path);
    assert!(image[32768..36864].iter().all(|&b| b == 0x01));
    // Source region untouched by the copy itself.
    assert!(image[..4096].iter().all(|&b| b == 0x01));
}

#[test]
fn dev2dev_batches_and_chunks_through_ram_buffer() {
    let mut fx = fixture(false);

    // No primary extents: window is secondary-only; buffer of 8K forces
    // the 20K extent through the chunked path.
    fx.io.create_storage(4096, 8192).expect("create storage");

    let mut moves = ExtentList::new();
    // Two small moves that fit one fill pass…
    moves.append(Extent::new(0, 57344, 4096, DEFAULT_USER_DATA));
    moves.append(Extent::new(4096, 61440, 4096, DEFAULT_USER_DATA));
    // …and one larger than the whole buffer.
    moves.append(Extent::new(8192, 36864, 20480, DEFAULT_USER_DATA));
    fx.io
        .flush_copy_bytes(CopyDir::Dev2Dev, &mut moves)
        .expect("dev2dev");

    let image = device_bytes(&fx.device_path);
    assert!(image[57344..61440].iter().all(|&b| b == 0x01));
    assert!(image[61440..65536].iter().all(|&b| b == 0x02));
    // 20K from device offset 8K (blocks 2..=6) landed at offset 36K.
    for block in 0..5_usize {
        let at = 36864 + block * 4096;
        let marker = 3 + block as u8;
        assert!(
            image[at..at + 4096].iter().all(|&b| b == marker),
            "chunked block {block} landed wrong"
        );
    }
}

#[test]
fn zero_bytes_clears_device_and_validates_bounds() {
    let mut fx = fixture(false);
    fx.io.create_storage(4096, 4096).expect("create storage");

    fx.io
        .zero_bytes(ZeroTarget::Device, 4096, 8192)
        .expect("zero device");
    let image = device_bytes(&fx.device_path);
    assert!(image[4096..12288].iter().all(|&b| b == 0));
    assert!(image[..4096].iter().all(|&b| b == 0x01));

    let err = fx
        .io
        .zero_bytes(ZeroTarget::Device, DEV_LEN as u64 - 1024, 4096)
        .unwrap_err();
    assert!(matches!(err, RemapError::Overflow(_)));

    let err = fx
        .io
        .zero_bytes(ZeroTarget::Storage, 0, 1 << 40)
        .unwrap_err();
    assert!(matches!(err, RemapError::Overflow(_)));
}

#[test]
fn simulate_run_suppresses_device_writes() {
    let mut fx = fixture(true);
    fx.io.create_storage(4096, 4096).expect("create storage");

    let before = device_bytes(&fx.device_path);
    let mut moves = ExtentList::new();
    moves.append(Extent::new(0, 8192, 4096, DEFAULT_USER_DATA));
    fx.io
        .flush_copy_bytes(CopyDir::Dev2Dev, &mut moves)
        .expect("dev2dev");
    fx.io
        .zero_bytes(ZeroTarget::Device, 0, 4096)
        .expect("zero");
    fx.io.flush_bytes().expect("flush");

    assert_eq!(device_bytes(&fx.device_path), before);
}

#[test]
fn create_storage_twice_is_rejected() {
    let mut fx = fixture(false);
    fx.io.create_storage(4096, 4096).expect("create storage");
    let err = fx.io.create_storage(4096, 4096).unwrap_err();
    assert!(matches!(err, RemapError::AlreadyOpen));

    // After an explicit teardown a fresh window may be built.
    fx.io.close_storage().expect("close");
    fx.io.create_storage(4096, 4096).expect("recreate storage");
}

//! DFU flows against a recording OTA backend.

use std::cell::RefCell;
use std::rc::Rc;

use packfs::builder::ArchiveBuilder;
use packfs::imagefs::dfu::{file_dfu, Ota, StreamDfu, DFU_STREAM_BUFSIZE};
use packfs::imagefs::{verify_archive, AppDesc, DefaultNaming, ImageNaming};
use packfs::process::Status;
use packfs::record::MetaType;
use packfs::{PackError, Result};

#[derive(Default)]
struct OtaLog {
    begins: u32,
    ends: u32,
    set_boots: u32,
    begun_size: u32,
    written: Vec<u8>,
}

/// Recording backend; `Handle` is a token so unbalanced `end` calls are
/// structurally impossible to miss.
struct MockOta {
    log: Rc<RefCell<OtaLog>>,
    app: AppDesc,
    fail_begin: bool,
}

impl MockOta {
    fn new(app: AppDesc) -> (Self, Rc<RefCell<OtaLog>>) {
        let log = Rc::new(RefCell::new(OtaLog::default()));
        (
            Self {
                log: log.clone(),
                app,
                fail_begin: false,
            },
            log,
        )
    }
}

impl Ota for MockOta {
    type Partition = u32;
    type Handle = u32;

    fn next_update_partition(&mut self) -> Result<u32> {
        Ok(1)
    }

    fn begin(&mut self, _partition: u32, image_size: u32) -> Result<u32> {
        if self.fail_begin {
            return Err(PackError::NoResource);
        }
        let mut log = self.log.borrow_mut();
        log.begins += 1;
        log.begun_size = image_size;
        Ok(77)
    }

    fn write(&mut self, handle: &mut u32, data: &[u8]) -> Result<()> {
        assert_eq!(*handle, 77);
        self.log.borrow_mut().written.extend_from_slice(data);
        Ok(())
    }

    fn end(&mut self, handle: u32) -> Result<()> {
        assert_eq!(handle, 77);
        self.log.borrow_mut().ends += 1;
        Ok(())
    }

    fn set_boot(&mut self, _partition: u32) -> Result<()> {
        self.log.borrow_mut().set_boots += 1;
        Ok(())
    }

    fn partition_desc(&mut self, _partition: u32) -> Result<AppDesc> {
        Ok(self.app.clone())
    }
}

fn demo_app() -> AppDesc {
    AppDesc {
        project_name: "widget".into(),
        version: "3.4".into(),
    }
}

fn dfu_archive(image: &[u8], lzo: bool) -> Vec<u8> {
    let mut b = ArchiveBuilder::new();
    b.add_meta("project", MetaType::String, b"", b"widget").unwrap();
    b.add_regular("manifest.txt", b"release notes").unwrap();
    if lzo {
        b.add_image_lzo("firmware.bin", image, 512).unwrap();
    } else {
        b.add_image("firmware.bin", image).unwrap();
    }
    b.build().unwrap()
}

#[test]
fn file_dfu_flashes_and_swaps_boot() {
    let tmp = tempfile::tempdir().unwrap();
    let image: Vec<u8> = (0u32..2000).map(|i| (i % 256) as u8).collect();
    let archive = tmp.path().join("incoming.pack");
    std::fs::write(&archive, dfu_archive(&image, false)).unwrap();

    let (mut ota, log) = MockOta::new(demo_app());
    file_dfu(
        &mut ota,
        &DefaultNaming,
        tmp.path(),
        &archive,
        "firmware.bin",
        true,
    )
    .unwrap();

    let log = log.borrow();
    assert_eq!(log.begins, 1);
    assert_eq!(log.ends, 1);
    assert_eq!(log.set_boots, 1);
    assert_eq!(log.begun_size, 2000);
    assert_eq!(log.written, image);

    // ensure_mountable renamed the archive into the convention.
    assert!(!archive.exists());
    assert!(tmp.path().join("image-widget-v3.4.pack").exists());
}

#[test]
fn file_dfu_decompresses_lzo_images() {
    let tmp = tempfile::tempdir().unwrap();
    let image: Vec<u8> = b"FW".iter().copied().cycle().take(3000).collect();
    let archive = tmp.path().join("incoming.pack");
    std::fs::write(&archive, dfu_archive(&image, true)).unwrap();

    let (mut ota, log) = MockOta::new(demo_app());
    file_dfu(
        &mut ota,
        &DefaultNaming,
        tmp.path(),
        &archive,
        "firmware.bin",
        false,
    )
    .unwrap();

    let log = log.borrow();
    assert_eq!((log.begins, log.ends, log.set_boots), (1, 1, 1));
    // The partition receives logical (decompressed) image bytes.
    assert_eq!(log.written, image);
    // Without ensure_mountable the archive stays where it was.
    assert!(archive.exists());
}

#[test]
fn file_dfu_rejects_corrupt_image() {
    let tmp = tempfile::tempdir().unwrap();
    let image = vec![0xA5u8; 1000];
    let mut bytes = dfu_archive(&image, false);
    // Flip the last image byte: body hash still good, image hash not.
    let last = bytes.len() - 1;
    bytes[last] ^= 0xFF;
    let archive = tmp.path().join("incoming.pack");
    std::fs::write(&archive, &bytes).unwrap();

    let (mut ota, log) = MockOta::new(demo_app());
    let err = file_dfu(
        &mut ota,
        &DefaultNaming,
        tmp.path(),
        &archive,
        "firmware.bin",
        false,
    )
    .unwrap_err();
    assert!(matches!(err, PackError::HashMismatch));

    let log = log.borrow();
    // The OTA handle was still balanced, and no boot swap happened.
    assert_eq!(log.begins, 1);
    assert_eq!(log.ends, 1);
    assert_eq!(log.set_boots, 0);
}

#[test]
fn file_dfu_missing_subpath() {
    let tmp = tempfile::tempdir().unwrap();
    let archive = tmp.path().join("incoming.pack");
    std::fs::write(&archive, dfu_archive(&[1u8; 64], false)).unwrap();

    let (mut ota, log) = MockOta::new(demo_app());
    let err = file_dfu(
        &mut ota,
        &DefaultNaming,
        tmp.path(),
        &archive,
        "no-such-image.bin",
        false,
    )
    .unwrap_err();
    assert!(matches!(err, PackError::NotFound));
    assert_eq!(log.borrow().begins, 0);
    assert_eq!(log.borrow().set_boots, 0);
}

#[test]
fn stream_dfu_in_small_chunks() {
    let tmp = tempfile::tempdir().unwrap();
    let image: Vec<u8> = (0u32..1500).map(|i| (i * 3 % 256) as u8).collect();
    let bytes = dfu_archive(&image, false);

    let (mut ota, log) = MockOta::new(demo_app());
    let naming = DefaultNaming;
    let mut dfu = StreamDfu::start(
        &mut ota,
        &naming,
        tmp.path(),
        "firmware.bin",
        false,
        DFU_STREAM_BUFSIZE,
    )
    .unwrap();

    for piece in bytes.chunks(13) {
        let status = dfu.load_and_process(piece);
        assert!(
            matches!(status, Status::Ok | Status::Again | Status::Eof),
            "unexpected status {status:?}"
        );
    }
    assert_eq!(dfu.load_eof_and_flush(), Status::Eof);
    dfu.complete().unwrap();

    let log = log.borrow();
    assert_eq!(log.begins, 1);
    assert_eq!(log.ends, 1);
    assert_eq!(log.set_boots, 1);
    assert_eq!(log.written, image);

    // The scratch copy became the mountable archive.
    let stored = tmp.path().join("image-widget-v3.4.pack");
    assert!(stored.exists());
    assert!(!tmp.path().join(DefaultNaming.scratch_name()).exists());
    assert_eq!(std::fs::read(&stored).unwrap(), bytes);
    verify_archive(&stored, true).unwrap();
}

#[test]
fn stream_dfu_mirrors_compressed_archives_byte_exact() {
    let tmp = tempfile::tempdir().unwrap();
    let image: Vec<u8> = b"OTA!".iter().copied().cycle().take(2500).collect();
    let bytes = dfu_archive(&image, true);

    let (mut ota, log) = MockOta::new(demo_app());
    let naming = DefaultNaming;
    let mut dfu = StreamDfu::start(
        &mut ota,
        &naming,
        tmp.path(),
        "firmware.bin",
        false,
        DFU_STREAM_BUFSIZE,
    )
    .unwrap();
    for piece in bytes.chunks(97) {
        let status = dfu.load_and_process(piece);
        assert!(matches!(status, Status::Ok | Status::Again | Status::Eof));
    }
    dfu.complete().unwrap();

    assert_eq!(log.borrow().written, image);
    let stored = tmp.path().join("image-widget-v3.4.pack");
    assert_eq!(std::fs::read(&stored).unwrap(), bytes);
}

#[test]
fn stream_dfu_strips_image_section() {
    let tmp = tempfile::tempdir().unwrap();
    let image = vec![0xCDu8; 900];
    let bytes = dfu_archive(&image, false);

    let (mut ota, log) = MockOta::new(demo_app());
    let naming = DefaultNaming;
    let mut dfu = StreamDfu::start(
        &mut ota,
        &naming,
        tmp.path(),
        "firmware.bin",
        true,
        DFU_STREAM_BUFSIZE,
    )
    .unwrap();
    let status = dfu.load_and_process(&bytes);
    assert!(matches!(status, Status::Ok | Status::Again | Status::Eof));
    dfu.complete().unwrap();

    assert_eq!(log.borrow().written, image);

    // The stored copy is image-stripped yet still verifies: the body hash
    // does not cover the image section.
    let stored = tmp.path().join("image-widget-v3.4.pack");
    let stored_bytes = std::fs::read(&stored).unwrap();
    assert_eq!(stored_bytes.len(), bytes.len() - (32 + 900));
    verify_archive(&stored, true).unwrap();

    // Enumeration stops at the stripped image entry.
    let mut dir = packfs::ArchiveDir::open(&stored).unwrap();
    assert_eq!(dir.read_next().unwrap().unwrap().name, "manifest.txt");
    assert!(dir.read_next().unwrap().is_none());
}

#[test]
fn stream_dfu_cancel_cleans_up() {
    let tmp = tempfile::tempdir().unwrap();
    let image = vec![0x11u8; 2000];
    let bytes = dfu_archive(&image, false);

    let (mut ota, log) = MockOta::new(demo_app());
    let naming = DefaultNaming;
    let mut dfu = StreamDfu::start(
        &mut ota,
        &naming,
        tmp.path(),
        "firmware.bin",
        false,
        DFU_STREAM_BUFSIZE,
    )
    .unwrap();

    // Feed enough to open the OTA handle mid-image, then abandon.
    let cut = bytes.len() - 500;
    let status = dfu.load_and_process(&bytes[..cut]);
    assert!(matches!(status, Status::Ok | Status::Again));
    let scratch = tmp.path().join(DefaultNaming.scratch_name());
    assert!(scratch.exists());
    dfu.cancel().unwrap();

    let log = log.borrow();
    assert_eq!(log.begins, 1);
    // Cancel balanced the open handle.
    assert_eq!(log.ends, 1);
    assert_eq!(log.set_boots, 0);
    assert!(!scratch.exists());
}

#[test]
fn stream_dfu_truncated_stream_fails() {
    let tmp = tempfile::tempdir().unwrap();
    let bytes = dfu_archive(&[0x22u8; 800], false);

    let (mut ota, log) = MockOta::new(demo_app());
    let naming = DefaultNaming;
    let mut dfu = StreamDfu::start(
        &mut ota,
        &naming,
        tmp.path(),
        "firmware.bin",
        false,
        DFU_STREAM_BUFSIZE,
    )
    .unwrap();

    let cut = bytes.len() - 100;
    let _ = dfu.load_and_process(&bytes[..cut]);
    assert!(dfu.complete().is_err());

    let log = log.borrow();
    // begin happened mid-image; complete still balanced it and never swapped.
    assert_eq!(log.begins, 1);
    assert_eq!(log.ends, 1);
    assert_eq!(log.set_boots, 0);
}

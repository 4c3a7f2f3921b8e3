use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tempfile::TempDir;
use tokio::sync::Semaphore;
use vdisk_core::{
    Access, BlobDirStore, BlobDirStoreConfig, ContentRef, ContentStore, Dispatcher,
    DispatcherOptions, Disposition, FileSystemOps, FsError, HandleId, MemoryStore,
    MemoryStoreOptions, ObjectReader, PointerRecord, SaveStats, SharedTree, StoreError,
    TreeGateway, TreeStore, UploadOptions, UploadSession, UploadSource,
};

const INDEX: &str = "vdisk-index.json";

struct Harness<S> {
    store: Arc<S>,
    tree: Arc<SharedTree>,
    ops: Dispatcher<SharedTree>,
    dir: TempDir,
}

fn options() -> DispatcherOptions {
    DispatcherOptions {
        write_timeout: Some(Duration::from_secs(10)),
        ..DispatcherOptions::default()
    }
}

fn mount<S: ContentStore + 'static>(store: Arc<S>, dir: TempDir, options: DispatcherOptions) -> Harness<S> {
    let shared: Arc<dyn ContentStore> = store.clone();
    let gateway = TreeGateway::new(
        Arc::clone(&shared),
        PointerRecord::new(dir.path().join("data.dat")),
        INDEX,
    );
    let tree = SharedTree::new(gateway);
    let ops = Dispatcher::new(Arc::clone(&tree), shared, options);
    Harness {
        store,
        tree,
        ops,
        dir,
    }
}

fn harness() -> Harness<MemoryStore> {
    mount(
        Arc::new(MemoryStore::new()),
        TempDir::new().unwrap(),
        options(),
    )
}

async fn put_file<S: ContentStore>(h: &Harness<S>, path: &str, data: &[u8]) {
    let open = h
        .ops
        .create_file(path, Access::Write, Disposition::CreateAlways)
        .await
        .unwrap();
    assert_eq!(h.ops.write_file(open.handle, data, 0).await.unwrap(), data.len());
    h.ops.close_file(open.handle).await.unwrap();
    h.ops.shutdown().await;
}

async fn get_file<S: ContentStore>(h: &Harness<S>, path: &str) -> Vec<u8> {
    let open = h
        .ops
        .create_file(path, Access::Read, Disposition::OpenExisting)
        .await
        .unwrap();
    let mut out = Vec::new();
    let mut buf = [0u8; 16];
    loop {
        let n = h
            .ops
            .read_file(open.handle, &mut buf, out.len() as u64)
            .await
            .unwrap();
        out.extend_from_slice(&buf[..n]);
        if n < buf.len() {
            break;
        }
    }
    h.ops.close_file(open.handle).await.unwrap();
    out
}

const GATED_UPLOADS: usize = 4;

/// Store that hands each chunk to an upload only when a permit is added to
/// that upload's gate. Uploads are numbered in the order they start; the end
/// of a stream takes a permit too. Tree saves pass straight through.
struct GatedStore {
    inner: MemoryStore,
    gates: Vec<Semaphore>,
    started: AtomicUsize,
}

impl GatedStore {
    fn new() -> Self {
        Self {
            inner: MemoryStore::new(),
            gates: (0..GATED_UPLOADS).map(|_| Semaphore::new(0)).collect(),
            started: AtomicUsize::new(0),
        }
    }

    /// Let the first upload take `chunks` more steps.
    fn release(&self, chunks: usize) {
        self.release_upload(0, chunks);
    }

    fn release_upload(&self, upload: usize, chunks: usize) {
        self.gates[upload].add_permits(chunks);
    }
}

#[async_trait]
impl ContentStore for GatedStore {
    async fn upload_sequential(
        &self,
        name: &str,
        declared_size: Option<u64>,
        mut source: UploadSource,
    ) -> Result<ContentRef, StoreError> {
        if name == INDEX {
            return self.inner.upload_sequential(name, declared_size, source).await;
        }
        let gate = &self.gates[self.started.fetch_add(1, Ordering::SeqCst)];
        let mut data = Vec::new();
        loop {
            let permit = gate.acquire().await.map_err(|_| StoreError::Closed)?;
            permit.forget();
            match source.next_chunk().await {
                Some(chunk) => data.extend_from_slice(&chunk),
                None => break,
            }
        }
        self.inner.upload(name, Bytes::from(data)).await
    }

    async fn download(&self, content: &ContentRef) -> Result<Bytes, StoreError> {
        self.inner.download(content).await
    }

    async fn open_stream(
        &self,
        hash: &str,
        key: Option<&str>,
    ) -> Result<Box<dyn ObjectReader>, StoreError> {
        self.inner.open_stream(hash, key).await
    }
}

async fn wait_until_final<S>(h: &Harness<S>, path: &str) {
    for _ in 0..400 {
        if h.tree.lookup(path).await.is_some_and(|leaf| !leaf.is_pending()) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("{path} never finalized");
}

#[tokio::test]
async fn test_create_directory_saves_once() {
    let h = harness();

    h.ops.create_directory("/Docs").await.unwrap();
    let root = h.tree.snapshot().await;
    assert_eq!(root.children.len(), 1);
    assert_eq!(root.children[0].name, "Docs");
    assert!(root.children[0].is_folder());
    assert_eq!(h.store.upload_count(INDEX), 1);

    assert_eq!(
        h.ops.create_directory("/Docs").await,
        Err(FsError::AlreadyExists)
    );
    assert_eq!(h.store.upload_count(INDEX), 1);
    assert_eq!(h.tree.snapshot().await.children.len(), 1);
}

#[tokio::test]
async fn test_create_directory_name_rules() {
    let h = harness();
    assert_eq!(h.ops.create_directory("/ab").await, Err(FsError::InvalidName));
    assert_eq!(
        h.ops.create_directory("/bad|name").await,
        Err(FsError::InvalidName)
    );
    assert_eq!(
        h.ops.create_directory("/Missing/Child").await,
        Err(FsError::PathNotFound)
    );
    assert_eq!(h.store.upload_count(INDEX), 0);
}

#[tokio::test]
async fn test_write_then_declare_size_finalizes_once() {
    let h = harness();
    h.ops.create_directory("/Docs").await.unwrap();

    let data: Vec<u8> = (0..37u8).collect();
    let open = h
        .ops
        .create_file("/Docs/a.txt", Access::Write, Disposition::CreateNew)
        .await
        .unwrap();
    assert_eq!(h.ops.write_file(open.handle, &data, 0).await.unwrap(), 37);
    h.ops.set_end_of_file(open.handle, 37).await.unwrap();
    h.ops.close_file(open.handle).await.unwrap();
    h.ops.shutdown().await;

    assert_eq!(h.store.upload_count("a.txt"), 1);
    // mkdir, provisional leaf, final hash
    assert_eq!(h.store.upload_count(INDEX), 3);
    assert_eq!(h.tree.stats(), SaveStats { completed: 3, failed: 0 });

    let leaf = h.tree.lookup("/Docs/a.txt").await.unwrap();
    assert!(!leaf.is_pending());
    assert!(!leaf.is_folder());
    assert_eq!(leaf.size, 37);
    assert_eq!(get_file(&h, "/Docs/a.txt").await, data);
}

#[tokio::test]
async fn test_sentinel_leaf_reads_as_pending() {
    let h = mount(Arc::new(GatedStore::new()), TempDir::new().unwrap(), options());

    let open = h
        .ops
        .create_file("/slow.bin", Access::Write, Disposition::CreateNew)
        .await
        .unwrap();
    h.store.release(1);
    h.ops
        .write_file(open.handle, b"0123456789", 0)
        .await
        .unwrap();
    h.ops.set_end_of_file(open.handle, 10).await.unwrap();

    // The provisional leaf is saved; the object is not there yet
    let leaf = h.tree.lookup("/slow.bin").await.unwrap();
    assert!(leaf.is_pending());
    assert_eq!(
        h.ops
            .create_file("/slow.bin", Access::Read, Disposition::OpenExisting)
            .await,
        Err(FsError::Pending)
    );
    assert_eq!(h.ops.get_file_information("/slow.bin").await.unwrap().size, 10);

    h.store.release(1);
    h.ops.close_file(open.handle).await.unwrap();
    h.ops.shutdown().await;

    assert_eq!(get_file(&h, "/slow.bin").await, b"0123456789");
}

#[tokio::test]
async fn test_write_waits_for_store() {
    let store = Arc::new(GatedStore::new());
    let upload = Arc::new(UploadSession::new(
        HandleId(1),
        "big.bin",
        Arc::clone(&store) as Arc<dyn ContentStore>,
        UploadOptions::default(),
    ));
    upload.set_size(20);

    let writer = {
        let upload = Arc::clone(&upload);
        tokio::spawn(async move { upload.write(Bytes::from(vec![1u8; 10])).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!writer.is_finished());
    assert_eq!(upload.flushed(), 0);

    store.release(1);
    writer.await.unwrap().unwrap();
    assert_eq!(upload.flushed(), 10);
    assert!(!upload.is_finished());

    store.release(1);
    upload.write(Bytes::from(vec![2u8; 10])).await.unwrap();
    assert_eq!(upload.flushed(), 20);
    assert!(upload.is_finished());

    store.release(1);
    let content = upload.close().await.unwrap().unwrap();
    let data = store.download(&content).await.unwrap();
    assert_eq!(&data[..10], &[1u8; 10]);
    assert_eq!(&data[10..], &[2u8; 10]);
}

#[tokio::test]
async fn test_close_declares_written_length() {
    let h = harness();
    let open = h
        .ops
        .create_file("/notes.txt", Access::Write, Disposition::CreateNew)
        .await
        .unwrap();
    h.ops
        .write_file(open.handle, b"first ", 0)
        .await
        .unwrap();
    h.ops
        .write_file(open.handle, b"second", 6)
        .await
        .unwrap();

    // Still being written: visible through the session
    let listing = h.ops.find_files("/").await.unwrap();
    assert_eq!(listing.len(), 1);
    assert_eq!(listing[0].name, "notes.txt");
    assert_eq!(listing[0].size, 12);
    assert!(h.tree.lookup("/notes.txt").await.is_none());

    h.ops.close_file(open.handle).await.unwrap();
    h.ops.shutdown().await;
    assert_eq!(get_file(&h, "/notes.txt").await, b"first second");
    assert_eq!(
        h.ops.close_file(open.handle).await,
        Err(FsError::InvalidHandle)
    );
}

#[tokio::test]
async fn test_empty_created_file_is_published() {
    let h = harness();
    let open = h
        .ops
        .create_file("/empty.txt", Access::Write, Disposition::CreateNew)
        .await
        .unwrap();
    h.ops.close_file(open.handle).await.unwrap();
    h.ops.shutdown().await;

    let info = h.ops.get_file_information("/empty.txt").await.unwrap();
    assert_eq!(info.size, 0);
    assert!(get_file(&h, "/empty.txt").await.is_empty());
}

#[tokio::test]
async fn test_open_for_write_without_writing_keeps_content() {
    let h = harness();
    put_file(&h, "/keep.txt", b"original").await;
    let before = h.store.upload_count("keep.txt");

    let open = h
        .ops
        .create_file("/keep.txt", Access::ReadWrite, Disposition::OpenExisting)
        .await
        .unwrap();
    h.ops.close_file(open.handle).await.unwrap();
    h.ops.shutdown().await;

    assert_eq!(h.store.upload_count("keep.txt"), before);
    assert_eq!(get_file(&h, "/keep.txt").await, b"original");
}

#[tokio::test]
async fn test_overwrite_replaces_content() {
    let h = harness();
    put_file(&h, "/data.bin", b"version one").await;
    put_file(&h, "/data.bin", b"v2").await;

    assert_eq!(get_file(&h, "/data.bin").await, b"v2");
    assert_eq!(h.tree.snapshot().await.children.len(), 1);
}

#[tokio::test]
async fn test_create_file_errors() {
    let h = harness();
    assert_eq!(
        h.ops
            .create_file("/nope.txt", Access::Read, Disposition::OpenExisting)
            .await,
        Err(FsError::NotFound)
    );
    assert_eq!(
        h.ops
            .create_file("/Missing/a.txt", Access::Write, Disposition::CreateNew)
            .await,
        Err(FsError::PathNotFound)
    );

    h.ops.create_directory("/Docs").await.unwrap();
    assert_eq!(
        h.ops
            .create_file("/Docs", Access::Read, Disposition::CreateNew)
            .await,
        Err(FsError::AlreadyExists)
    );
    let dir = h
        .ops
        .create_file("/Docs", Access::Read, Disposition::OpenExisting)
        .await
        .unwrap();
    assert!(dir.is_directory);

    let mut buf = [0u8; 4];
    assert_eq!(
        h.ops.read_file(dir.handle, &mut buf, 0).await,
        Err(FsError::InvalidHandle)
    );
    assert_eq!(
        h.ops.write_file(dir.handle, b"x", 0).await,
        Err(FsError::InvalidHandle)
    );
    h.ops.close_file(dir.handle).await.unwrap();
}

#[tokio::test]
async fn test_move_and_rename() {
    let h = harness();
    h.ops.create_directory("/Docs").await.unwrap();
    h.ops.create_directory("/Archive").await.unwrap();
    put_file(&h, "/Docs/a.txt", b"alpha").await;
    put_file(&h, "/Docs/other.txt", b"other").await;

    h.ops
        .move_file("/Docs/a.txt", "/Archive/b.txt", false)
        .await
        .unwrap();
    assert!(h.tree.lookup("/Docs/a.txt").await.is_none());
    assert_eq!(get_file(&h, "/Archive/b.txt").await, b"alpha");

    assert_eq!(
        h.ops.move_file("/Docs/other.txt", "/Archive/b.txt", false).await,
        Err(FsError::AlreadyExists)
    );
    h.ops
        .move_file("/Docs/other.txt", "/Archive/b.txt", true)
        .await
        .unwrap();
    assert_eq!(get_file(&h, "/Archive/b.txt").await, b"other");

    assert_eq!(
        h.ops.move_file("/Docs/gone.txt", "/Archive/gone.txt", false).await,
        Err(FsError::PathNotFound)
    );
    assert_eq!(
        h.ops.move_file("/Archive/b.txt", "/Archive/b", false).await,
        Err(FsError::InvalidName)
    );
    assert_eq!(
        h.ops.move_file("/Archive", "/Archive/Inner", false).await,
        Err(FsError::InvalidName)
    );
    assert_eq!(
        h.ops.move_file("/Archive/b.txt", "/Docs", true).await,
        Err(FsError::AlreadyExists)
    );

    h.ops.move_file("/Archive", "/Docs/Archive", false).await.unwrap();
    assert_eq!(get_file(&h, "/Docs/Archive/b.txt").await, b"other");
}

#[tokio::test]
async fn test_delete_rules() {
    let h = harness();
    h.ops.create_directory("/Docs").await.unwrap();
    put_file(&h, "/Docs/a.txt", b"alpha").await;

    assert_eq!(
        h.ops.delete_directory("/Docs").await,
        Err(FsError::DirectoryNotEmpty)
    );
    assert_eq!(h.ops.delete_file("/Docs").await, Err(FsError::AccessDenied));
    assert_eq!(
        h.ops.delete_file("/Docs/zzz.txt").await,
        Err(FsError::PathNotFound)
    );
    assert_eq!(
        h.ops.delete_file("/Nope/a.txt").await,
        Err(FsError::PathNotFound)
    );

    h.ops.delete_file("/Docs/a.txt").await.unwrap();
    h.ops.delete_directory("/Docs").await.unwrap();
    assert!(h.ops.find_files("/").await.unwrap().is_empty());
}

#[tokio::test]
async fn test_listing_and_information() {
    let h = harness();
    h.ops.create_directory("/Docs").await.unwrap();
    put_file(&h, "/Docs/a.txt", b"12345").await;

    let listing = h.ops.find_files("/Docs").await.unwrap();
    assert_eq!(listing.len(), 1);
    assert_eq!(listing[0].name, "a.txt");
    assert_eq!(listing[0].size, 5);
    assert!(!listing[0].is_directory);

    assert!(h.ops.get_file_information("/Docs").await.unwrap().is_directory);
    assert!(h.ops.get_file_information("/").await.unwrap().is_directory);
    assert_eq!(
        h.ops.get_file_information("/Docs/b.txt").await,
        Err(FsError::NotFound)
    );
    assert_eq!(
        h.ops.find_files("/Docs/a.txt").await,
        Err(FsError::PathNotFound)
    );

    let space = h.ops.disk_free_space();
    assert_eq!(space.total, 1 << 30);
    assert_eq!(space.free, space.total);
}

#[tokio::test]
async fn test_failed_save_fails_open_and_keeps_pointer() {
    let h = harness();
    h.ops.create_directory("/Docs").await.unwrap();
    let pointer = PointerRecord::new(h.dir.path().join("data.dat"));
    let saved = pointer.read().await.unwrap();

    h.store.set_fail_uploads(true);
    h.ops.create_directory("/Music").await.unwrap();
    assert_eq!(h.tree.stats(), SaveStats { completed: 1, failed: 1 });
    assert_eq!(pointer.read().await, Some(saved));
    // The in-memory tree still has the change
    assert!(h.tree.lookup("/Music").await.is_some());
}

#[tokio::test]
async fn test_remount_sees_saved_tree() {
    let h = harness();
    h.ops.create_directory("/Docs").await.unwrap();
    put_file(&h, "/Docs/a.txt", b"persisted").await;

    let Harness { store, dir, .. } = h;
    let remounted = mount(store, dir, options());
    let root = remounted.tree.snapshot().await;
    assert_eq!(root.children.len(), 1);
    assert_eq!(get_file(&remounted, "/Docs/a.txt").await, b"persisted");
}

#[tokio::test]
async fn test_unreachable_tree_mounts_empty() {
    let h = harness();
    h.ops.create_directory("/Docs").await.unwrap();

    let Harness { store, dir, .. } = h;
    store.set_fail_downloads(true);
    let remounted = mount(store, dir, options());
    assert!(remounted.ops.find_files("/").await.unwrap().is_empty());
}

#[tokio::test]
async fn test_store_side_decryption_on_chunked_transport() {
    let store = Arc::new(MemoryStore::with_options(MemoryStoreOptions {
        chunk_size: 10,
        ..Default::default()
    }));
    let h = mount(
        store,
        TempDir::new().unwrap(),
        DispatcherOptions {
            decrypt_locally: false,
            ..options()
        },
    );
    let data: Vec<u8> = (0..100u8).collect();
    put_file(&h, "/plain.bin", &data).await;
    assert_eq!(get_file(&h, "/plain.bin").await, data);
}

#[tokio::test]
async fn test_blob_directory_backend() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(
        BlobDirStore::new(BlobDirStoreConfig::new(dir.path().join("objects")))
            .await
            .unwrap(),
    );
    let h = mount(store, dir, options());

    h.ops.create_directory("/Photos").await.unwrap();
    let data = vec![0x5Au8; 5000];
    put_file(&h, "/Photos/big.raw", &data).await;
    assert_eq!(get_file(&h, "/Photos/big.raw").await, data);

    let pointer = PointerRecord::new(h.dir.path().join("data.dat"));
    let content = pointer.read().await.unwrap();
    assert!(h.store.exists(&content.hash));
}

#[tokio::test]
async fn test_rename_while_upload_pending_keeps_content() {
    let h = mount(Arc::new(GatedStore::new()), TempDir::new().unwrap(), options());
    h.ops.create_directory("/Docs").await.unwrap();

    let open = h
        .ops
        .create_file("/Docs/tmp123", Access::Write, Disposition::CreateNew)
        .await
        .unwrap();
    h.store.release(1);
    h.ops
        .write_file(open.handle, b"0123456789", 0)
        .await
        .unwrap();
    h.ops.close_file(open.handle).await.unwrap();
    assert!(h.tree.lookup("/Docs/tmp123").await.unwrap().is_pending());

    // Save-by-rename while the object is still uploading
    h.ops
        .move_file("/Docs/tmp123", "/Docs/final.txt", false)
        .await
        .unwrap();
    h.store.release(1);
    h.ops.shutdown().await;

    let leaf = h.tree.lookup("/Docs/final.txt").await.unwrap();
    assert!(!leaf.is_pending());
    assert_eq!(leaf.size, 10);
    assert!(h.tree.lookup("/Docs/tmp123").await.is_none());
    assert_eq!(get_file(&h, "/Docs/final.txt").await, b"0123456789");
}

#[tokio::test]
async fn test_overwrite_while_upload_pending_keeps_newest() {
    let h = mount(Arc::new(GatedStore::new()), TempDir::new().unwrap(), options());

    let first = h
        .ops
        .create_file("/data.bin", Access::Write, Disposition::CreateNew)
        .await
        .unwrap();
    h.store.release_upload(0, 1);
    h.ops.write_file(first.handle, b"old", 0).await.unwrap();
    h.ops.close_file(first.handle).await.unwrap();

    let second = h
        .ops
        .create_file("/data.bin", Access::Write, Disposition::CreateAlways)
        .await
        .unwrap();
    h.store.release_upload(1, 1);
    h.ops
        .write_file(second.handle, b"new content", 0)
        .await
        .unwrap();
    h.ops.close_file(second.handle).await.unwrap();

    // Newer upload lands first, the older one after it
    h.store.release_upload(1, 1);
    wait_until_final(&h, "/data.bin").await;
    h.store.release_upload(0, 1);
    h.ops.shutdown().await;

    assert_eq!(h.store.inner.upload_count("data.bin"), 2);
    let leaf = h.tree.lookup("/data.bin").await.unwrap();
    assert_eq!(leaf.size, 11);
    assert_eq!(get_file(&h, "/data.bin").await, b"new content");
}

#[tokio::test]
async fn test_delete_while_upload_pending() {
    let h = mount(Arc::new(GatedStore::new()), TempDir::new().unwrap(), options());

    let open = h
        .ops
        .create_file("/gone.bin", Access::Write, Disposition::CreateNew)
        .await
        .unwrap();
    h.store.release(1);
    h.ops.write_file(open.handle, b"bytes", 0).await.unwrap();
    h.ops.close_file(open.handle).await.unwrap();

    h.ops.delete_file("/gone.bin").await.unwrap();
    h.store.release(1);
    h.ops.shutdown().await;

    assert!(h.tree.lookup("/gone.bin").await.is_none());
    assert!(h.ops.find_files("/").await.unwrap().is_empty());
}

#[tokio::test]
async fn test_append_to_existing_file_is_refused() {
    let h = harness();
    put_file(&h, "/log.txt", b"line1\n").await;

    let open = h
        .ops
        .create_file("/log.txt", Access::Write, Disposition::OpenExisting)
        .await
        .unwrap();
    assert_eq!(
        h.ops.write_file(open.handle, b"line2\n", 6).await,
        Err(FsError::AccessDenied)
    );
    h.ops.close_file(open.handle).await.unwrap();
    h.ops.shutdown().await;

    assert_eq!(get_file(&h, "/log.txt").await, b"line1\n");
}

#[tokio::test]
async fn test_close_with_unfilled_gap_reports_loss() {
    let h = harness();
    let open = h
        .ops
        .create_file("/holes.bin", Access::Write, Disposition::CreateNew)
        .await
        .unwrap();
    h.ops.write_file(open.handle, b"abc", 0).await.unwrap();
    // Ahead of the stream: parked, never reachable
    h.ops.write_file(open.handle, b"xyz", 10).await.unwrap();

    assert_eq!(
        h.ops.close_file(open.handle).await,
        Err(FsError::AccessDenied)
    );
    assert_eq!(
        h.ops.close_file(open.handle).await,
        Err(FsError::InvalidHandle)
    );
    h.ops.shutdown().await;
    assert!(h.tree.lookup("/holes.bin").await.is_none());
}

//! 崩溃一致性场景
//!
//! 崩溃的模拟方式：丢弃 `ScaleFs` 上下文、在同一块内存盘上重新
//! 装载。内存中的对象、逻辑日志与缓存随上下文消失，盘上留下的
//! 只有写回过设备的内容——与断电后的磁盘状态一致。

use std::sync::Arc;

use scalefs::{mkfs, BlockDevice, FsError, FsGeometry, MemDisk, MnodeType, ScaleFs};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn new_disk(nblocks: u32) -> Arc<MemDisk> {
    init_logging();
    let disk = Arc::new(MemDisk::new(nblocks as usize));
    let dev: Arc<dyn BlockDevice> = disk.clone();
    mkfs(
        &dev,
        FsGeometry {
            total_blocks: nblocks,
            ninodes: 512,
        },
    )
    .unwrap();
    disk
}

fn mount(disk: &Arc<MemDisk>) -> Arc<ScaleFs> {
    let dev: Arc<dyn BlockDevice> = disk.clone();
    ScaleFs::mount(dev).unwrap()
}

#[test]
fn create_then_crash_before_fsync() {
    let disk = new_disk(8192);
    let fs = mount(&disk);
    let free0 = fs.free_blocks();
    let root = fs.root();

    fs.create(root, "a", MnodeType::File).unwrap();
    drop(fs); // 崩溃

    let fs = mount(&disk);
    assert_eq!(fs.lookup(fs.root(), "a"), Err(FsError::NotFound));
    // 没有 inode 或块泄漏
    assert_eq!(fs.free_blocks(), free0);
}

#[test]
fn create_fsync_crash() {
    let disk = new_disk(8192);
    let fs = mount(&disk);
    let root = fs.root();

    fs.create(root, "a", MnodeType::File).unwrap();
    fs.fsync(root).unwrap();
    drop(fs);

    let fs = mount(&disk);
    let a = fs.lookup(fs.root(), "a").unwrap();
    let st = fs.stat(a).unwrap();
    assert_eq!(st.mtype, MnodeType::File);
    assert_eq!(st.size, 0);
    assert_eq!(st.nlink, 1);
    assert!(st.inum.is_some());
}

#[test]
fn rename_across_directories() {
    let disk = new_disk(8192);
    let fs = mount(&disk);
    let root = fs.root();

    let d1 = fs.create(root, "d1", MnodeType::Dir).unwrap();
    let d2 = fs.create(root, "d2", MnodeType::Dir).unwrap();
    let x = fs.create(d1, "x", MnodeType::File).unwrap();
    fs.fsync(root).unwrap();
    fs.fsync(d1).unwrap();

    let before = fs.stat(x).unwrap();
    let inum = before.inum.expect("x should be on disk");

    fs.rename(d1, "x", d2, "y").unwrap();
    fs.fsync(d2).unwrap();
    drop(fs);

    let fs = mount(&disk);
    let root = fs.root();
    let d1 = fs.lookup(root, "d1").unwrap();
    let d2 = fs.lookup(root, "d2").unwrap();

    assert_eq!(fs.lookup(d1, "x"), Err(FsError::NotFound));
    let y = fs.lookup(d2, "y").unwrap();
    let st = fs.stat(y).unwrap();
    assert_eq!(st.nlink, 1);
    assert_eq!(st.inum, Some(inum));
    assert_eq!(st.gen, before.gen);
}

#[test]
fn rename_same_directory() {
    let disk = new_disk(8192);
    let fs = mount(&disk);
    let root = fs.root();

    let d = fs.create(root, "d", MnodeType::Dir).unwrap();
    let x = fs.create(d, "x", MnodeType::File).unwrap();
    fs.fsync(root).unwrap();
    fs.fsync(d).unwrap();
    let inum = fs.stat(x).unwrap().inum.unwrap();

    fs.rename(d, "x", d, "x2").unwrap();
    fs.fsync(d).unwrap();
    drop(fs);

    let fs = mount(&disk);
    let d = fs.lookup(fs.root(), "d").unwrap();
    assert_eq!(fs.lookup(d, "x"), Err(FsError::NotFound));
    let x2 = fs.lookup(d, "x2").unwrap();
    let st = fs.stat(x2).unwrap();
    assert_eq!(st.inum, Some(inum));
    assert_eq!(st.nlink, 1);
}

#[test]
fn rename_directory_flushes_parents_first() {
    let disk = new_disk(8192);
    let fs = mount(&disk);
    let root = fs.root();

    let a = fs.create(root, "a", MnodeType::Dir).unwrap();
    let d = fs.create(root, "d", MnodeType::Dir).unwrap();
    let b = fs.create(a, "b", MnodeType::Dir).unwrap();
    fs.create(b, "c", MnodeType::File).unwrap();
    fs.fsync(root).unwrap();
    fs.fsync(a).unwrap();
    fs.fsync(b).unwrap();

    fs.rename(a, "b", d, "b2").unwrap();
    fs.fsync(d).unwrap();
    drop(fs);

    let fs = mount(&disk);
    let root = fs.root();
    let a = fs.lookup(root, "a").unwrap();
    let d = fs.lookup(root, "d").unwrap();
    assert_eq!(fs.lookup(a, "b"), Err(FsError::NotFound));
    let b2 = fs.lookup(d, "b2").unwrap();
    assert_eq!(fs.stat(b2).unwrap().mtype, MnodeType::Dir);
    // 移动后的目录内容原样保留
    assert!(fs.lookup(b2, "c").is_ok());
}

#[test]
fn rename_overwrites_existing_file() {
    let disk = new_disk(8192);
    let fs = mount(&disk);
    let root = fs.root();

    let d1 = fs.create(root, "d1", MnodeType::Dir).unwrap();
    let d2 = fs.create(root, "d2", MnodeType::Dir).unwrap();
    let x = fs.create(d1, "x", MnodeType::File).unwrap();
    fs.create(d2, "y", MnodeType::File).unwrap();
    fs.fsync(root).unwrap();
    fs.fsync(d1).unwrap();
    fs.fsync(d2).unwrap();
    let x_inum = fs.stat(x).unwrap().inum.unwrap();

    fs.rename(d1, "x", d2, "y").unwrap();
    fs.fsync(d2).unwrap();
    drop(fs);

    let fs = mount(&disk);
    let root = fs.root();
    let d1 = fs.lookup(root, "d1").unwrap();
    let d2 = fs.lookup(root, "d2").unwrap();
    assert_eq!(fs.lookup(d1, "x"), Err(FsError::NotFound));
    let y = fs.lookup(d2, "y").unwrap();
    assert_eq!(fs.stat(y).unwrap().inum, Some(x_inum));
}

#[test]
fn link_depends_on_create() {
    let disk = new_disk(8192);
    let fs = mount(&disk);
    let root = fs.root();

    let p1 = fs.create(root, "p1", MnodeType::Dir).unwrap();
    let p2 = fs.create(root, "p2", MnodeType::Dir).unwrap();
    fs.fsync(root).unwrap();

    let f = fs.create(p1, "x", MnodeType::File).unwrap();
    fs.link(p2, "z", f).unwrap();
    // 只 fsync /p2：链接依赖把 f 的 create 拉进来
    fs.fsync(p2).unwrap();
    drop(fs);

    let fs = mount(&disk);
    let root = fs.root();
    let p2 = fs.lookup(root, "p2").unwrap();
    let z = fs.lookup(p2, "z").unwrap();
    let st = fs.stat(z).unwrap();
    assert!(st.inum.is_some(), "linked inode must exist on disk");
    assert_eq!(st.nlink, 1);
    // /p1 的名字要等 /p1 自己的 fsync
    let p1 = fs.lookup(root, "p1").unwrap();
    assert_eq!(fs.lookup(p1, "x"), Err(FsError::NotFound));
}

#[test]
fn link_both_parents_fsynced_share_inode() {
    let disk = new_disk(8192);
    let fs = mount(&disk);
    let root = fs.root();

    let p1 = fs.create(root, "p1", MnodeType::Dir).unwrap();
    let p2 = fs.create(root, "p2", MnodeType::Dir).unwrap();
    fs.fsync(root).unwrap();

    let f = fs.create(p1, "x", MnodeType::File).unwrap();
    fs.link(p2, "z", f).unwrap();
    fs.fsync(p2).unwrap();
    fs.fsync(p1).unwrap();
    drop(fs);

    let fs = mount(&disk);
    let root = fs.root();
    let p1 = fs.lookup(root, "p1").unwrap();
    let p2 = fs.lookup(root, "p2").unwrap();
    let x = fs.lookup(p1, "x").unwrap();
    let z = fs.lookup(p2, "z").unwrap();
    let sx = fs.stat(x).unwrap();
    let sz = fs.stat(z).unwrap();
    assert_eq!(sx.inum, sz.inum);
    assert_eq!(sx.nlink, 2);
}

#[test]
fn unlink_with_open_reference_reclaims_on_boot() {
    let disk = new_disk(8192);
    let fs = mount(&disk);
    let root = fs.root();

    let a = fs.create(root, "a", MnodeType::File).unwrap();
    fs.write_file(a, 0, &[7u8; 1024]).unwrap();
    fs.fsync(root).unwrap();
    fs.fsync(a).unwrap();
    let free_linked = fs.free_blocks();

    // 打开引用挡住了 fsync 时的就地删除
    fs.mget(a).unwrap();
    fs.unlink(root, "a").unwrap();
    fs.fsync(root).unwrap();
    drop(fs); // 引用未释放即崩溃

    let fs = mount(&disk);
    assert_eq!(fs.lookup(fs.root(), "a"), Err(FsError::NotFound));
    // 启动回收把 inode 连同它的两个数据块一起释放了
    assert_eq!(fs.free_blocks(), free_linked + 2);
    // inode 可以再次使用
    let b = fs.create(fs.root(), "b", MnodeType::File).unwrap();
    fs.fsync(fs.root()).unwrap();
    assert!(fs.stat(b).unwrap().inum.is_some());
}

#[test]
fn unlink_without_references_frees_inode_at_fsync() {
    let disk = new_disk(8192);
    let fs = mount(&disk);
    let root = fs.root();

    let a = fs.create(root, "a", MnodeType::File).unwrap();
    fs.write_file(a, 0, &[3u8; 2048]).unwrap();
    fs.fsync(root).unwrap();
    fs.fsync(a).unwrap();
    let free_linked = fs.free_blocks();

    fs.unlink(root, "a").unwrap();
    fs.fsync(root).unwrap();
    // 两阶段释放：提交之后块回到空闲链表
    assert_eq!(fs.free_blocks(), free_linked + 4);
    drop(fs);

    let fs = mount(&disk);
    assert_eq!(fs.lookup(fs.root(), "a"), Err(FsError::NotFound));
    assert_eq!(fs.free_blocks(), free_linked + 4);
}

#[test]
fn journal_overflow_splits_into_multiple_commits() {
    let disk = new_disk(16384);
    let fs = mount(&disk);
    let root = fs.root();

    // 60 个目录各带一个内容块，一次 fsync 产生的子事务远超日志容量
    for i in 0..60 {
        fs.create(root, &format!("d{}", i), MnodeType::Dir).unwrap();
    }
    fs.fsync(root).unwrap();
    drop(fs);

    let fs = mount(&disk);
    let root = fs.root();
    for i in 0..60 {
        let d = fs.lookup(root, &format!("d{}", i)).unwrap();
        assert_eq!(fs.stat(d).unwrap().mtype, MnodeType::Dir);
    }
}

#[test]
fn write_fsync_crash_roundtrip() {
    let disk = new_disk(8192);
    let fs = mount(&disk);
    let root = fs.root();

    // 150 块跨越直接、一级间接和二级间接寻址
    let payload: Vec<u8> = (0..150 * 512).map(|i| (i * 31 % 251) as u8).collect();
    let f = fs.create(root, "data", MnodeType::File).unwrap();
    fs.write_file(f, 0, &payload).unwrap();
    fs.fsync(root).unwrap();
    fs.fsync(f).unwrap();
    let free_after = fs.free_blocks();
    drop(fs);

    let fs = mount(&disk);
    let f = fs.lookup(fs.root(), "data").unwrap();
    let st = fs.stat(f).unwrap();
    assert_eq!(st.size, payload.len() as u64);
    let mut out = vec![0u8; payload.len()];
    assert_eq!(fs.read_file(f, 0, &mut out).unwrap(), payload.len());
    assert_eq!(out, payload);
    // 分配器守恒：重启后空闲块数与崩溃前一致
    assert_eq!(fs.free_blocks(), free_after);
}

#[test]
fn overwrite_at_offset_survives_crash() {
    let disk = new_disk(8192);
    let fs = mount(&disk);
    let root = fs.root();

    let f = fs.create(root, "data", MnodeType::File).unwrap();
    fs.write_file(f, 0, &[0xaa; 4096]).unwrap();
    fs.fsync(root).unwrap();
    fs.fsync(f).unwrap();

    // 跨页的非对齐覆盖写
    let patch: Vec<u8> = (0..1000).map(|i| (i % 256) as u8).collect();
    fs.write_file(f, 777, &patch).unwrap();
    fs.fsync(f).unwrap();
    drop(fs);

    let fs = mount(&disk);
    let f = fs.lookup(fs.root(), "data").unwrap();
    let mut out = vec![0u8; 4096];
    fs.read_file(f, 0, &mut out).unwrap();
    assert!(out[..777].iter().all(|&b| b == 0xaa));
    assert_eq!(&out[777..1777], &patch[..]);
    assert!(out[1777..].iter().all(|&b| b == 0xaa));
}

#[test]
fn recovery_is_idempotent() {
    let disk = new_disk(8192);
    let fs = mount(&disk);
    let root = fs.root();
    for i in 0..10 {
        fs.create(root, &format!("f{}", i), MnodeType::File).unwrap();
    }
    fs.fsync(root).unwrap();
    drop(fs);

    // 第一次装载把盘带到恢复后的稳定状态
    let d2 = Arc::new(disk.snapshot());
    let fs = mount(&d2);
    drop(fs);

    // 在稳定状态的副本上再装载一次，盘上不应有任何变化
    let d3 = Arc::new(d2.snapshot());
    let fs = mount(&d3);
    drop(fs);
    assert_eq!(d2.contents(), d3.contents());
}

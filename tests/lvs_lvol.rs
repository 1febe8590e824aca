use nix::errno::Errno;

use lvol_engine::{
    bdev::create_malloc_bdev,
    bs::ClearMethod,
    lvs::{Lvs, LvsOpts},
};

pub mod common;

const CLUSTER_SZ: u64 = 64 * 1024;

/// xattr values carry a terminator, the way they sit on disk
fn xattr_value(s: &str) -> Vec<u8> {
    let mut v = s.as_bytes().to_vec();
    v.push(0);
    v
}

#[test]
fn lvs_lvol_test() {
    common::test_init(2);

    create_malloc_bdev("lvoldisk", None, 64 * 1024, 512).unwrap();

    let pool = common::run(async {
        Lvs::init(
            common::pool_dev("lvoldisk"),
            &LvsOpts {
                name: "pool".into(),
                cluster_sz: CLUSTER_SZ,
            },
        )
        .await
        .unwrap()
    });

    // names must be present, terminated and unique
    common::run({
        let pool = pool.clone();
        async move {
            let e = pool
                .create_lvol("", 1024, true, ClearMethod::Default)
                .await
                .expect_err("empty name");
            assert_eq!(e.errno(), Errno::EINVAL);

            let e = pool
                .create_lvol(
                    &"x".repeat(64),
                    1024,
                    true,
                    ClearMethod::Default,
                )
                .await
                .expect_err("name too long");
            assert_eq!(e.errno(), Errno::EINVAL);

            // exactly 63 bytes leaves room for the terminator
            let l = pool
                .create_lvol(
                    &"x".repeat(63),
                    1024,
                    true,
                    ClearMethod::Default,
                )
                .await
                .unwrap();
            l.close().await.unwrap();
            l.destroy().await.unwrap();
        }
    });

    let lvol = common::run({
        let pool = pool.clone();
        async move {
            pool.create_lvol("lv1", 128 * 1024, true, ClearMethod::Unmap)
                .await
                .unwrap()
        }
    });
    assert_eq!(lvol.name(), "lv1");
    assert_eq!(lvol.refs(), 1);
    assert_eq!(lvol.size(), 128 * 1024);
    assert!(lvol.is_thin());

    common::run({
        let pool = pool.clone();
        async move {
            let e = pool
                .create_lvol("lv1", 1024, true, ClearMethod::Default)
                .await
                .expect_err("duplicate lvol name");
            assert_eq!(e.errno(), Errno::EEXIST);
        }
    });

    // open is idempotent and reference counted: 1 -> 0 -> 1 -> 0
    common::run({
        let lvol = lvol.clone();
        async move {
            lvol.close().await.unwrap();
            assert_eq!(lvol.refs(), 0);
            lvol.open().await.unwrap();
            assert_eq!(lvol.refs(), 1);
            lvol.open().await.unwrap();
            assert_eq!(lvol.refs(), 2);
            lvol.close().await.unwrap();
            lvol.close().await.unwrap();
            assert_eq!(lvol.refs(), 0);

            let e = lvol.close().await.expect_err("not open");
            assert_eq!(e.errno(), Errno::EINVAL);

            lvol.open().await.unwrap();
        }
    });

    // destroying an open lvol is refused
    common::run({
        let lvol = lvol.clone();
        async move {
            let e = lvol.destroy().await.expect_err("still open");
            assert_eq!(e.errno(), Errno::EBUSY);
        }
    });

    // rename: collision, success, idempotence, rollback on sync failure
    let lvol2 = common::run({
        let pool = pool.clone();
        async move {
            pool.create_lvol("lv2", 64 * 1024, true, ClearMethod::Default)
                .await
                .unwrap()
        }
    });
    common::run({
        let pool = pool.clone();
        let lvol = lvol.clone();
        async move {
            let e = lvol.rename("lv2").await.expect_err("collision");
            assert_eq!(e.errno(), Errno::EEXIST);
            assert_eq!(lvol.name(), "lv1");
            let on_disk = pool
                .blobstore()
                .blob_xattr(lvol.blob_id().unwrap(), "name")
                .unwrap();
            assert_eq!(on_disk, xattr_value("lv1"));

            lvol.rename("lv1b").await.unwrap();
            assert_eq!(lvol.name(), "lv1b");
            // renaming to the same name again succeeds as a no-op
            lvol.rename("lv1b").await.unwrap();

            pool.blobstore().fail_md_syncs(1);
            let e = lvol.rename("lv1c").await.expect_err("sync fails");
            assert_eq!(e.errno(), Errno::EIO);
            assert_eq!(lvol.name(), "lv1b");
            let on_disk = pool
                .blobstore()
                .blob_xattr(lvol.blob_id().unwrap(), "name")
                .unwrap();
            assert_eq!(on_disk, xattr_value("lv1b"));
        }
    });

    // resize and read-only
    common::run({
        let lvol2 = lvol2.clone();
        async move {
            lvol2.resize(256 * 1024).await.unwrap();
            assert_eq!(lvol2.size(), 256 * 1024);

            let data = vec![0x5A_u8; 512];
            lvol2.write_at(0, &data).await.unwrap();

            lvol2.set_read_only().await.unwrap();
            let e = lvol2
                .write_at(0, &data)
                .await
                .expect_err("read-only lvol");
            assert_eq!(e.errno(), Errno::EPERM);
        }
    });

    // snapshot and clone
    common::run({
        let pool = pool.clone();
        let lvol = lvol.clone();
        async move {
            let pattern = vec![0x11_u8; 1024];
            lvol.write_at(0, &pattern).await.unwrap();

            let snap = lvol.create_snapshot("snap1").await.unwrap();
            assert_eq!(snap.refs(), 1);
            assert!(!snap.deletable()); // lv1b is now its clone
            assert!(lvol.deletable());

            // overwrite the origin; the snapshot keeps the old data
            let newdata = vec![0x22_u8; 1024];
            lvol.write_at(0, &newdata).await.unwrap();

            let mut buf = vec![0_u8; 1024];
            snap.read_at(0, &mut buf).await.unwrap();
            assert_eq!(buf, pattern);
            lvol.read_at(0, &mut buf).await.unwrap();
            assert_eq!(buf, newdata);

            // a clone of the snapshot sees the snapshot's data
            let clone = snap.create_clone("clone1").await.unwrap();
            clone.read_at(0, &mut buf).await.unwrap();
            assert_eq!(buf, pattern);

            // inflating the clone detaches it from the snapshot
            clone.inflate().await.unwrap();
            assert!(!clone.is_thin() || clone.deletable());
            clone.read_at(0, &mut buf).await.unwrap();
            assert_eq!(buf, pattern);

            // the origin can shed its parent too
            lvol.decouple_parent().await.unwrap();

            clone.close().await.unwrap();
            clone.destroy().await.unwrap();
            assert!(pool.lookup_lvol("clone1").is_none());

            snap.close().await.unwrap();
            snap.destroy().await.unwrap();
        }
    });

    // teardown
    common::run({
        let pool = pool.clone();
        let lvol = lvol.clone();
        let lvol2 = lvol2.clone();
        async move {
            lvol.close().await.unwrap();
            lvol.destroy().await.unwrap();
            lvol2.close().await.unwrap();
            lvol2.destroy().await.unwrap();
            assert!(pool.lvols().is_empty());
            pool.destroy().await.unwrap();
        }
    });
}

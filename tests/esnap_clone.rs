use nix::errno::Errno;

use lvol_engine::{
    bdev::create_malloc_bdev,
    bs::{BlobOpenOpts, BlobOpts},
    lvs::{Lvs, LvsOpts},
};

pub mod common;

const CLUSTER_SZ: u64 = 64 * 1024;
static ESNAP_UUID: &str = "a27fd8fe-d4b9-431e-a044-271016228ce4";

/// terminated esnap identifier, as stored on the blob
fn esnap_id(s: &str) -> Vec<u8> {
    let mut v = s.as_bytes().to_vec();
    v.push(0);
    v
}

#[test]
fn esnap_clone_test() {
    common::test_init(2);

    create_malloc_bdev("pooldisk", None, 64 * 1024, 512).unwrap();

    // the external snapshot device: 192 blocks of 0xEE
    let esnap_bdev =
        create_malloc_bdev(ESNAP_UUID, Some(ESNAP_UUID), 192, 512).unwrap();
    common::run({
        let esnap_bdev = esnap_bdev.clone();
        async move {
            common::fill_bdev(&esnap_bdev, 0, &vec![0xEE_u8; 192 * 512])
                .await;
        }
    });

    let pool = common::run(async {
        Lvs::init(
            common::pool_dev("pooldisk"),
            &LvsOpts {
                name: "epool".into(),
                cluster_sz: CLUSTER_SZ,
            },
        )
        .await
        .unwrap()
    });

    // a clone of a present device is not degraded and reads its data
    let clone = common::run({
        let pool = pool.clone();
        async move {
            pool.create_bdev_clone(ESNAP_UUID, "eclone").await.unwrap()
        }
    });
    assert!(!clone.is_degraded());
    assert!(clone.is_esnap_clone());
    assert_eq!(clone.size(), 128 * 1024); // rounded up to two clusters

    common::run({
        let clone = clone.clone();
        async move {
            let mut buf = vec![0_u8; 512];
            clone.read_at(0, &mut buf).await.unwrap();
            assert_eq!(buf, vec![0xEE_u8; 512]);

            // reads past the end of the device come back as zeroes
            clone.read_at(200, &mut buf).await.unwrap();
            assert_eq!(buf, vec![0_u8; 512]);

            // write into cluster 0; the rest of the cluster is copied
            // from the device
            let data = vec![0x99_u8; 512];
            clone.write_at(0, &data).await.unwrap();
            let mut buf = vec![0_u8; 1024];
            clone.read_at(0, &mut buf).await.unwrap();
            assert_eq!(&buf[.. 512], &data[..]);
            assert_eq!(&buf[512 ..], &vec![0xEE_u8; 512][..]);

            clone.close().await.unwrap();
        }
    });

    // take the store and the device down, then bring the store back
    // without the device
    common::run({
        let pool = pool.clone();
        async move {
            pool.unload().await.unwrap();
        }
    });
    esnap_bdev.unregister().unwrap();

    let pool = common::run(async {
        Lvs::load(common::pool_dev("pooldisk")).await.unwrap()
    });
    let clone = pool.lookup_lvol("eclone").expect("eclone is back");

    // the device is gone: the lvol still opens, degraded
    common::run({
        let clone = clone.clone();
        async move {
            clone.open().await.unwrap();
        }
    });
    assert!(clone.is_degraded());
    let missing = pool
        .esnap_missing_lookup(ESNAP_UUID)
        .expect("waiting for the device");
    assert_eq!(missing.lvol_count(), 1);
    assert_eq!(missing.holds(), 0);

    common::run({
        let clone = clone.clone();
        async move {
            // the locally written cluster still serves reads and writes
            let mut buf = vec![0_u8; 512];
            clone.read_at(0, &mut buf).await.unwrap();
            assert_eq!(buf, vec![0x99_u8; 512]);
            clone.write_at(0, &vec![0x98_u8; 512]).await.unwrap();

            // unallocated regions fail with an I/O error
            let e = clone
                .read_at(128, &mut buf)
                .await
                .expect_err("degraded read");
            assert_eq!(e.errno(), Errno::EIO);
            let e = clone
                .write_at(128, &vec![0_u8; 512])
                .await
                .expect_err("degraded copy-on-write");
            assert_eq!(e.errno(), Errno::EIO);
        }
    });

    // hotplug: registering the device resolves the wait on the store's
    // reactor
    let esnap_bdev =
        create_malloc_bdev(ESNAP_UUID, Some(ESNAP_UUID), 192, 512).unwrap();
    common::settle();

    assert!(!clone.is_degraded());
    assert!(pool.esnap_missing_lookup(ESNAP_UUID).is_none());
    assert_eq!(missing.holds(), 0);

    common::run({
        let esnap_bdev = esnap_bdev.clone();
        let clone = clone.clone();
        async move {
            // the new device registration starts out blank, so cluster 1
            // now reads zeroes through the real device
            let mut buf = vec![0_u8; 512];
            clone.read_at(128, &mut buf).await.unwrap();
            assert_eq!(buf, vec![0_u8; 512]);

            // and the device is claimed while in use
            assert_eq!(
                esnap_bdev.open(true).expect_err("claimed").errno(),
                Errno::EPERM
            );
        }
    });

    // a snapshot of a degraded clone takes over the wait for the device
    common::run({
        let pool = pool.clone();
        let clone = clone.clone();
        async move {
            clone.close().await.unwrap();
            pool.unload().await.unwrap();
            clone_snapshot_ownership(pool.name()).await;
        }
    });
}

/// Degraded ownership moves with snapshots and returns when the snapshot
/// is deleted again.
async fn clone_snapshot_ownership(pool_name: String) {
    let esnap_bdev =
        lvol_engine::core::Bdev::lookup_by_name(ESNAP_UUID).unwrap();
    esnap_bdev.unregister().unwrap();

    let pool = Lvs::load(common::pool_dev("pooldisk")).await.unwrap();
    assert_eq!(pool.name(), pool_name);
    let clone = pool.lookup_lvol("eclone").unwrap();
    clone.open().await.unwrap();
    assert!(clone.is_degraded());

    let snap = clone.create_snapshot("esnap-snap").await.unwrap();

    // the snapshot owns the external parent and the wait; the original
    // is now a regular clone of the snapshot
    assert!(snap.is_degraded());
    assert!(!clone.is_degraded());
    assert!(snap.is_esnap_clone());
    assert!(!clone.is_esnap_clone());
    let missing = pool.esnap_missing_lookup(ESNAP_UUID).unwrap();
    assert_eq!(missing.lvol_count(), 1);

    // deleting the snapshot hands everything back
    snap.close().await.unwrap();
    snap.destroy().await.unwrap();
    assert!(clone.is_degraded());
    assert!(clone.is_esnap_clone());
    let missing = pool.esnap_missing_lookup(ESNAP_UUID).unwrap();
    assert_eq!(missing.lvol_count(), 1);

    clone.close().await.unwrap();

    // malformed esnap identifiers are rejected outright
    let bs = pool.blobstore();
    for bad in [
        esnap_id(&ESNAP_UUID[.. 35]),             // too short
        ESNAP_UUID.as_bytes().to_vec(),           // unterminated
        esnap_id(&ESNAP_UUID.to_uppercase()),     // not canonical
    ] {
        let blob_id = bs
            .create_blob(BlobOpts {
                num_clusters: 1,
                thin_provision: true,
                xattrs: vec![
                    ("name".into(), esnap_id("bad")),
                    ("uuid".into(), esnap_id(ESNAP_UUID)),
                ],
                esnap_cookie: Some(bad),
                ..Default::default()
            })
            .await
            .unwrap();
        let e = bs
            .open_blob(blob_id, BlobOpenOpts::default())
            .await
            .expect_err("invalid esnap id");
        assert_eq!(e.errno(), Errno::EINVAL);
        bs.delete_blob(blob_id).await.unwrap();
    }

    pool.destroy().await.unwrap();
}

use nix::errno::Errno;

use lvol_engine::{
    bdev::create_malloc_bdev,
    core::Bdev,
    lvs::{Lvs, LvsOpts},
};

pub mod common;

static DISK1: &str = "disk1";
static DISK2: &str = "disk2";

const CLUSTER_SZ: u64 = 64 * 1024;

#[test]
fn lvs_pool_test() {
    common::test_init(2);

    let disk1 =
        create_malloc_bdev(DISK1, None, 32 * 1024, 512).expect("disk1");
    let disk2 =
        create_malloc_bdev(DISK2, None, 32 * 1024, 512).expect("disk2");

    // no pool on this disk yet
    common::run(async {
        assert!(Lvs::load(common::pool_dev(DISK1)).await.is_err());
    });

    let opts = LvsOpts {
        name: "tpool".into(),
        cluster_sz: CLUSTER_SZ,
    };

    let pool = common::run({
        let opts = opts.clone();
        async move {
            Lvs::init(common::pool_dev(DISK1), &opts).await.unwrap()
        }
    });
    assert_eq!(pool.name(), "tpool");
    assert_eq!(Lvs::iter().len(), 1);
    assert!(Lvs::lookup("tpool").is_some());
    let pool_uuid = pool.uuid();
    assert!(Lvs::lookup_by_uuid(&pool_uuid).is_some());

    // a name is unique across all registered stores
    common::run({
        let opts = opts.clone();
        async move {
            let e = Lvs::init(common::pool_dev(DISK2), &opts)
                .await
                .expect_err("duplicate name");
            assert_eq!(e.errno(), Errno::EEXIST);
        }
    });

    // a cluster smaller than the device block size is rejected
    common::run(async {
        let e = Lvs::init(
            common::pool_dev(DISK2),
            &LvsOpts {
                name: "small".into(),
                cluster_sz: 256,
            },
        )
        .await
        .expect_err("bad cluster size");
        assert_eq!(e.errno(), Errno::EINVAL);
    });

    // oversized and empty names are rejected
    common::run(async {
        let long = "n".repeat(64);
        let e = Lvs::init(
            common::pool_dev(DISK2),
            &LvsOpts {
                name: long,
                cluster_sz: CLUSTER_SZ,
            },
        )
        .await
        .expect_err("unterminated name");
        assert_eq!(e.errno(), Errno::EINVAL);

        let e = Lvs::init(
            common::pool_dev(DISK2),
            &LvsOpts {
                name: String::new(),
                cluster_sz: CLUSTER_SZ,
            },
        )
        .await
        .expect_err("empty name");
        assert_eq!(e.errno(), Errno::EINVAL);
    });

    // a 63 byte name (with room for the terminator) is fine
    let longest = "l".repeat(63);
    common::run({
        let pool = pool.clone();
        let longest = longest.clone();
        async move {
            pool.rename(&longest).await.unwrap();
            assert_eq!(pool.name(), longest);
            pool.rename("tpool").await.unwrap();
        }
    });

    // rename to the current name is a no-op
    common::run({
        let pool = pool.clone();
        async move {
            pool.rename("tpool").await.unwrap();
            assert_eq!(pool.name(), "tpool");
        }
    });

    // rename with a failing metadata sync leaves both names untouched and
    // allows a retry
    common::run({
        let pool = pool.clone();
        async move {
            pool.blobstore().fail_md_syncs(1);
            let e = pool.rename("tpool2").await.expect_err("sync fails");
            assert_eq!(e.errno(), Errno::EIO);
            assert_eq!(pool.name(), "tpool");

            pool.rename("tpool2").await.unwrap();
            assert_eq!(pool.name(), "tpool2");
            assert!(Lvs::lookup("tpool").is_none());
            assert!(Lvs::lookup("tpool2").is_some());
            pool.rename("tpool").await.unwrap();
        }
    });

    // rename collisions against other stores are refused
    let other = common::run(async move {
        Lvs::init(
            common::pool_dev(DISK2),
            &LvsOpts {
                name: "other".into(),
                cluster_sz: CLUSTER_SZ,
            },
        )
        .await
        .unwrap()
    });
    common::run({
        let other = other.clone();
        async move {
            let e = other.rename("tpool").await.expect_err("name taken");
            assert_eq!(e.errno(), Errno::EEXIST);
            assert_eq!(other.name(), "other");
        }
    });

    // an open lvol blocks unload and destroy
    let lvol = common::run({
        let pool = pool.clone();
        async move {
            pool.create_lvol(
                "lvol0",
                128 * 1024,
                true,
                Default::default(),
            )
            .await
            .unwrap()
        }
    });
    common::run({
        let pool = pool.clone();
        async move {
            assert_eq!(
                pool.unload().await.expect_err("still open").errno(),
                Errno::EBUSY
            );
            assert_eq!(
                pool.destroy().await.expect_err("still open").errno(),
                Errno::EBUSY
            );
        }
    });

    // write a pattern so the reload below can prove durability
    common::run({
        let lvol = lvol.clone();
        async move {
            let data = vec![0xAB_u8; 512];
            lvol.write_at(0, &data).await.unwrap();
            let mut readback = vec![0_u8; 512];
            lvol.read_at(0, &mut readback).await.unwrap();
            assert_eq!(readback, data);
            lvol.close().await.unwrap();
        }
    });

    common::run({
        let pool = pool.clone();
        async move {
            pool.unload().await.unwrap();
        }
    });
    assert!(Lvs::lookup("tpool").is_none());

    // the base bdev is released on unload
    {
        let bdev = Bdev::lookup_by_name(DISK1).unwrap();
        assert!(!bdev.is_claimed());
        let desc = bdev.open(true).unwrap();
        drop(desc);
    }

    // load finds the catalog and the data again
    let pool = common::run(async {
        Lvs::load(common::pool_dev(DISK1)).await.unwrap()
    });
    assert_eq!(pool.name(), "tpool");
    assert_eq!(pool.uuid(), pool_uuid);
    assert_eq!(pool.lvols().len(), 1);

    let lvol = pool.lookup_lvol("lvol0").expect("lvol0 is back");
    common::run({
        let lvol = lvol.clone();
        async move {
            lvol.open().await.unwrap();
            let mut readback = vec![0_u8; 512];
            lvol.read_at(0, &mut readback).await.unwrap();
            assert_eq!(readback, vec![0xAB_u8; 512]);
            lvol.close().await.unwrap();
        }
    });

    // grow after the device expanded
    let old_capacity = pool.capacity();
    common::run({
        let pool = pool.clone();
        async move {
            pool.unload().await.unwrap();
        }
    });
    disk1.set_num_blocks(64 * 1024);
    let pool = common::run(async {
        Lvs::grow(common::pool_dev(DISK1)).await.unwrap()
    });
    assert!(pool.capacity() > old_capacity);

    // destroy drops the store from the device for good
    common::run({
        let pool = pool.clone();
        async move {
            pool.destroy().await.unwrap();
            assert!(Lvs::load(common::pool_dev(DISK1)).await.is_err());
        }
    });
    assert!(Lvs::lookup("tpool").is_none());

    common::run({
        let other = other.clone();
        async move {
            other.destroy().await.unwrap();
        }
    });

    disk1.unregister().unwrap();
    disk2.unregister().unwrap();
}

use std::sync::Arc;

use assert_matches::assert_matches;
use nix::errno::Errno;

use lvol_engine::{
    bdev::{create_malloc_bdev, BdevBsDev},
    bs::{
        BlobOpenOpts,
        BlobOpts,
        Blobstore,
        BsDev,
        BsError,
        BsOpts,
        EioBsDev,
        ExtIoOpts,
        MemoryDomain,
        ZeroesBsDev,
    },
    core::Bdev,
};

pub mod common;

#[test]
fn bs_dev_test() {
    common::test_init(2);

    zeroes_dev();
    eio_dev_lifecycle();
    bdev_backed_dev();
    blobstore_basics();
}

fn zeroes_dev() {
    common::run(async {
        let dev = ZeroesBsDev::new();
        assert_eq!(dev.blocklen(), 512);
        assert!(dev.is_zeroes(0, u64::MAX));

        let mut buf = vec![0xAA_u8; 1024];
        dev.read(&mut buf, 12345, 2).await.unwrap();
        assert!(buf.iter().all(|b| *b == 0));

        let mut a = vec![0xAA_u8; 512];
        let mut b = vec![0xBB_u8; 512];
        dev.readv(&mut [&mut a[..], &mut b[..]], 0, 2).await.unwrap();
        assert!(a.iter().chain(b.iter()).all(|b| *b == 0));

        // a memory domain hint cannot be honoured without a zero cluster
        let mut c = vec![0xCC_u8; 512];
        let e = dev
            .readv_ext(
                &mut [&mut c[..]],
                0,
                1,
                &ExtIoOpts {
                    memory_domain: Some(MemoryDomain),
                },
            )
            .await
            .expect_err("no memory domain support");
        assert_eq!(e.errno(), Errno::ENOTSUP);

        // the write family is rejected and the payload left alone
        let payload = vec![0x42_u8; 512];
        assert_matches!(
            dev.write(&payload, 0, 1).await,
            Err(BsError::WriteProtected { .. })
        );
        assert_matches!(
            dev.write_zeroes(0, 1).await,
            Err(BsError::WriteProtected { .. })
        );
        assert_matches!(
            dev.unmap(0, 1).await,
            Err(BsError::WriteProtected { .. })
        );
        assert_eq!(payload, vec![0x42_u8; 512]);

        // cluster backed: the hint is served from the reserved cluster
        let dev = ZeroesBsDev::cluster_backed(
            512,
            Arc::new(vec![0_u8; 64 * 1024]),
        );
        let mut d = vec![0xDD_u8; 512];
        dev.readv_ext(
            &mut [&mut d[..]],
            0,
            1,
            &ExtIoOpts {
                memory_domain: Some(MemoryDomain),
            },
        )
        .await
        .unwrap();
        assert!(d.iter().all(|b| *b == 0));
    });
}

fn eio_dev_lifecycle() {
    common::run(async {
        let dev = EioBsDev::create("missing-esnap").unwrap();
        assert_eq!(dev.refs(), 1);
        assert!(!dev.is_zeroes(0, 1));

        let c1 = dev.create_channel().expect("channel 1");
        let c2 = dev.create_channel().expect("channel 2");
        assert_eq!(dev.refs(), 3);

        // reads fail, writes are a contract violation
        let mut buf = vec![0_u8; 512];
        let e = dev.read(&mut buf, 0, 1).await.expect_err("always EIO");
        assert_eq!(e.errno(), Errno::EIO);
        assert_matches!(
            dev.write(&buf, 0, 1).await,
            Err(BsError::WriteProtected { .. })
        );

        // destroy drops the creation reference and forbids new channels
        dev.destroy().await;
        assert_eq!(dev.refs(), 2);
        assert!(dev.create_channel().is_none());
        assert!(!dev.is_freed());

        let e = dev.read(&mut buf, 7, 1).await.expect_err("still EIO");
        assert_eq!(e.errno(), Errno::EIO);

        dev.destroy_channel(c1);
        assert_eq!(dev.refs(), 1);
        assert!(!dev.is_freed());

        // the last channel releases the device
        dev.destroy_channel(c2);
        assert_eq!(dev.refs(), 0);
        assert!(dev.is_freed());
    });
}

fn bdev_backed_dev() {
    common::run(async {
        let bdev =
            create_malloc_bdev("bsdev-disk", None, 1024, 512).unwrap();
        common::fill_bdev(&bdev, 0, &vec![0xEE_u8; 1024]).await;

        // read-only: reads pass through, writes reject, the base is
        // claimed against read-write opens
        let dev = BdevBsDev::create("bsdev-disk", false, None).unwrap();
        assert_eq!(dev.blocklen(), 512);
        assert_eq!(dev.blockcnt(), 1024);

        let mut buf = vec![0_u8; 512];
        dev.read(&mut buf, 1, 1).await.unwrap();
        assert_eq!(buf, vec![0xEE_u8; 512]);

        assert_matches!(
            dev.write(&buf, 0, 1).await,
            Err(BsError::WriteProtected { .. })
        );

        assert_eq!(
            Bdev::lookup_by_name("bsdev-disk")
                .unwrap()
                .open(true)
                .expect_err("claimed read-only")
                .errno(),
            Errno::EPERM
        );

        drop(dev);

        // with the claim gone the device opens read-write again
        let dev = BdevBsDev::create("bsdev-disk", true, Some("lvs")).unwrap();
        let data = vec![0x77_u8; 512];
        dev.write(&data, 2, 1).await.unwrap();
        let mut buf = vec![0_u8; 512];
        dev.read(&mut buf, 2, 1).await.unwrap();
        assert_eq!(buf, data);

        drop(dev);
        bdev.unregister().unwrap();
    });
}

fn blobstore_basics() {
    common::run(async {
        let bdev = create_malloc_bdev("bs-disk", None, 2048, 512).unwrap();
        let dev = BdevBsDev::create("bs-disk", true, None).unwrap();
        let bs = Blobstore::init(
            Box::new(dev),
            &BsOpts {
                cluster_sz: 4096,
                bstype: "TEST".into(),
                reserve_zero_cluster: true,
            },
        )
        .await
        .unwrap();
        assert_eq!(bs.io_unit_size(), 512);
        assert_eq!(bs.cluster_size(), 4096);

        let ch = bs.alloc_io_channel();
        let id = bs
            .create_blob(BlobOpts {
                num_clusters: 2,
                thin_provision: true,
                ..Default::default()
            })
            .await
            .unwrap();

        let blob = bs.open_blob(id, BlobOpenOpts::default()).await.unwrap();
        assert!(blob.is_thin());
        assert!(!blob.is_clone());
        assert_eq!(blob.num_clusters(), 2);
        assert_eq!(blob.allocated_clusters(), 0);

        // a thin blob reads zeroes until written
        let mut buf = vec![0xAA_u8; 512];
        blob.read(&ch, &mut buf, 0).await.unwrap();
        assert!(buf.iter().all(|b| *b == 0));

        let data = vec![0x33_u8; 512];
        blob.write(&ch, &data, 1).await.unwrap();
        blob.read(&ch, &mut buf, 1).await.unwrap();
        assert_eq!(buf, data);
        assert_eq!(blob.allocated_clusters(), 1);

        blob.resize(4).await.unwrap();
        assert_eq!(blob.num_clusters(), 4);
        blob.sync_md().await.unwrap();
        blob.close().await.unwrap();

        bs.destroy().await.unwrap();
        bdev.unregister().unwrap();
    });
}

use nix::errno::Errno;

use lvol_engine::{
    bdev::{
        create_malloc_bdev,
        create_ro_bdev,
        delete_ro_bdev,
        ro_base_bdev,
        RoBdevOpts,
    },
    core::Bdev,
};

pub mod common;

#[test]
fn bdev_ro_test() {
    common::test_init(2);

    common::run(async {
        let base = create_malloc_bdev("base", None, 1024, 512).unwrap();
        common::fill_bdev(&base, 0, &vec![0x5C_u8; 2048]).await;

        // two views share one claim on the base
        let view1 =
            create_ro_bdev(Some("base"), None, RoBdevOpts::default())
                .unwrap();
        let view2 = create_ro_bdev(
            Some("base"),
            None,
            RoBdevOpts {
                name: Some("ro-two".into()),
                uuid: None,
            },
        )
        .unwrap();
        assert_eq!(view2.name(), "ro-two");
        assert_eq!(ro_base_bdev(&view1).unwrap().name(), "base");
        assert_eq!(view1.block_len(), 512);
        assert_eq!(view1.num_blocks(), 1024);

        // the claim blocks read-write access to the base
        assert_eq!(
            base.open(true).expect_err("claimed").errno(),
            Errno::EPERM
        );

        // the views themselves refuse writers too
        assert_eq!(
            view1.open(true).expect_err("read-only").errno(),
            Errno::EPERM
        );

        // reads are forwarded to the base
        let desc = view1.open(false).unwrap();
        let ch = desc.get_io_channel().unwrap();
        let mut buf = vec![0_u8; 512];
        ch.read_blocks(&mut buf, 1, 1).await.unwrap();
        assert_eq!(buf, vec![0x5C_u8; 512]);
        drop(desc);

        // dropping one view keeps the claim; dropping the last releases it
        delete_ro_bdev(&view1).unwrap();
        assert_eq!(
            base.open(true).expect_err("still one view").errno(),
            Errno::EPERM
        );

        delete_ro_bdev(&view2).unwrap();
        let desc = base.open(true).expect("claim released");
        drop(desc);

        // removing the base removes its views
        let view3 = create_ro_bdev(
            Some("base"),
            None,
            RoBdevOpts {
                name: Some("ro-three".into()),
                uuid: None,
            },
        )
        .unwrap();
        assert!(Bdev::lookup_by_name("ro-three").is_some());
        base.unregister().unwrap();
        assert!(Bdev::lookup_by_name("ro-three").is_none());
        assert!(ro_base_bdev(&view3).is_none());
    });
}

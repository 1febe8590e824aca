use futures::channel::oneshot;
use nix::errno::Errno;
use std::sync::Arc;

use lvol_engine::{
    bdev::create_malloc_bdev,
    core::{Cores, Reactors},
    lvs::{Lvol, Lvs, LvsOpts},
};

pub mod common;

static ESNAP_UUID: &str = "b39fe9af-e5c0-542f-b155-38212733d9f5";

/// read one block of the lvol on the given reactor
async fn read_on(core: u32, lvol: Arc<Lvol>) -> Result<Vec<u8>, Errno> {
    let (s, r) = oneshot::channel();
    Reactors::get_by_core(core).unwrap().send_future(async move {
        assert_eq!(Cores::current(), core);
        let mut buf = vec![0_u8; 512];
        let res = lvol.read_at(0, &mut buf).await;
        let _ = s.send(res.map(|_| buf).map_err(|e| e.errno()));
    });
    r.await.unwrap()
}

#[test]
fn esnap_channel_table_test() {
    common::test_init(2);

    create_malloc_bdev("chandisk", None, 32 * 1024, 512).unwrap();
    let esnap_bdev =
        create_malloc_bdev(ESNAP_UUID, Some(ESNAP_UUID), 64, 512).unwrap();

    let pool = common::run(async {
        Lvs::init(
            common::pool_dev("chandisk"),
            &LvsOpts {
                name: "chanpool".into(),
                cluster_sz: 32 * 1024,
            },
        )
        .await
        .unwrap()
    });

    let clone = common::run({
        let pool = pool.clone();
        async move {
            pool.create_bdev_clone(ESNAP_UUID, "chanclone").await.unwrap()
        }
    });

    // creation opened a channel on every reactor that existed at the time
    assert!(esnap_bdev.channel_count(0) > 0);
    assert!(esnap_bdev.channel_count(1) > 0);

    // reads work from any of them
    common::run({
        let clone = clone.clone();
        async move {
            assert!(read_on(0, clone.clone()).await.is_ok());
            assert!(read_on(1, clone.clone()).await.is_ok());
        }
    });

    // a reactor added later finds no channel: the first read fails with
    // out-of-memory while a rebind is posted to the owning reactor
    Reactors::add();
    let first = common::run({
        let clone = clone.clone();
        async move { read_on(2, clone).await }
    });
    assert_eq!(first.expect_err("no channel yet"), Errno::ENOMEM);

    // once the rebind has fanned out, the same read succeeds
    common::settle();
    assert!(esnap_bdev.channel_count(2) > 0);

    let second = common::run({
        let clone = clone.clone();
        async move { read_on(2, clone).await }
    });
    assert!(second.is_ok());

    // teardown closes every reactor's channel
    common::run({
        let clone = clone.clone();
        async move {
            clone.close().await.unwrap();
        }
    });
    for core in 0 .. 3 {
        assert_eq!(esnap_bdev.channel_count(core), 0);
    }

    common::run({
        let pool = pool.clone();
        async move {
            pool.destroy().await.unwrap();
        }
    });
}

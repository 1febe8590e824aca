use std::sync::Arc;

use parking_lot::Mutex;

use lvol_engine::bdev::{
    create_malloc_bdev,
    create_wait_bdev,
    delete_wait_bdev,
};

pub mod common;

static U0: &str = "11111111-1111-1111-1111-111111111111";
static U1: &str = "22222222-2222-2222-2222-222222222222";
static U2: &str = "33333333-3333-3333-3333-333333333333";

#[test]
fn bdev_wait_test() {
    common::test_init(2);

    let fired: Arc<Mutex<Vec<(String, String)>>> =
        Arc::new(Mutex::new(Vec::new()));

    let waiter = |tag: &'static str| {
        let fired = fired.clone();
        Box::new(move |bdev: &lvol_engine::core::Bdev| {
            fired
                .lock()
                .push((tag.to_string(), bdev.name().to_string()));
        })
    };

    let w0 = create_wait_bdev(None, None, U0, waiter("w0")).unwrap();
    let w1 = create_wait_bdev(None, None, U1, waiter("w1")).unwrap();
    let w2 = create_wait_bdev(None, None, U1, waiter("w2")).unwrap();
    assert_eq!(w0.num_blocks(), 0);

    // no waiter matches this uuid
    create_malloc_bdev("m2", Some(U2), 16, 512).unwrap();
    assert!(fired.lock().is_empty());

    // only the waiter for U0 fires
    create_malloc_bdev("m0", Some(U0), 16, 512).unwrap();
    assert_eq!(
        fired.lock().clone(),
        vec![("w0".to_string(), "m0".to_string())]
    );

    // both remaining waiters fire on U1
    fired.lock().clear();
    create_malloc_bdev("m1", Some(U1), 16, 512).unwrap();
    {
        let mut seen = fired.lock().clone();
        seen.sort();
        assert_eq!(
            seen,
            vec![
                ("w1".to_string(), "m1".to_string()),
                ("w2".to_string(), "m1".to_string()),
            ]
        );
    }

    // a deleted waiter no longer fires
    fired.lock().clear();
    delete_wait_bdev(&w0).unwrap();
    delete_wait_bdev(&w1).unwrap();
    create_malloc_bdev("m1b", Some(U1), 16, 512).unwrap();
    assert_eq!(
        fired.lock().clone(),
        vec![("w2".to_string(), "m1b".to_string())]
    );

    delete_wait_bdev(&w2).unwrap();

    // deleting a non-wait bdev through this interface is refused
    let m2 = lvol_engine::core::Bdev::lookup_by_name("m2").unwrap();
    assert!(delete_wait_bdev(&m2).is_err());
}

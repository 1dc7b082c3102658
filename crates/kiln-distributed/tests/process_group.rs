//! Blocking process groups as the trainer uses them, one thread per rank.

use kiln_distributed::{DistributedConfig, InProcessGroup, ProcessGroup};
use std::thread;

fn tcp_group<F, T>(port: u16, world_size: usize, body: F) -> Vec<T>
where
    F: Fn(ProcessGroup) -> T + Send + Copy + 'static,
    T: Send + 'static,
{
    let handles: Vec<_> = (0..world_size)
        .map(|rank| {
            thread::spawn(move || {
                let group = ProcessGroup::connect(DistributedConfig::new("127.0.0.1", port, rank, world_size))
                    .unwrap();
                body(group)
            })
        })
        .collect();
    handles.into_iter().map(|h| h.join().unwrap()).collect()
}

#[test]
fn test_tcp_any_and_all_reduce() {
    let results = tcp_group(29531, 3, |group| {
        let mut values = [group.rank() as f32, 2.0];
        group.all_reduce_f32(&mut values).unwrap();
        group.barrier().unwrap();
        let stop = group.any(group.rank() == 2).unwrap();
        let none = group.any(false).unwrap();
        (values, stop, none)
    });
    for (values, stop, none) in results {
        assert_eq!(values, [3.0, 6.0]);
        assert!(stop);
        assert!(!none);
    }
}

#[test]
fn test_tcp_rendezvous_same_tag() {
    let results = tcp_group(29532, 2, |group| group.rendezvous("kiln.test").is_ok());
    assert!(results.into_iter().all(|ok| ok));
}

#[test]
fn test_in_process_group_over_threads() {
    let handles: Vec<_> = InProcessGroup::create(4)
        .into_iter()
        .map(|backend| {
            thread::spawn(move || {
                let group = ProcessGroup::new(Box::new(backend)).unwrap();
                assert_eq!(group.world_size(), 4);
                group.barrier().unwrap();
                group.any(group.is_rank_zero()).unwrap()
            })
        })
        .collect();
    for handle in handles {
        assert!(handle.join().unwrap());
    }
}

#[test]
fn test_local_group_is_world_of_one() {
    let group = ProcessGroup::local().unwrap();
    assert_eq!(group.rank(), 0);
    assert_eq!(group.world_size(), 1);
    assert!(group.any(true).unwrap());
    group.barrier().unwrap();
}

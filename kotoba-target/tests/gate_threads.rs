//! 複数のコントローラスレッドが同時に待機している場合のイベントゲートのテスト

use kotoba_target::{EventGate, GateSignal, ThreadHandle};
use std::thread;
use std::time::{Duration, Instant};

const T1: ThreadHandle = ThreadHandle::new(1001);
const T2: ThreadHandle = ThreadHandle::new(1002);
const T3: ThreadHandle = ThreadHandle::new(1003);

fn wait_until_parked(gate: &EventGate, threads: &[ThreadHandle]) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !threads.iter().all(|t| gate.pending(*t) == 1) {
        assert!(Instant::now() < deadline, "waiters were never parked");
        thread::sleep(Duration::from_millis(1));
    }
}

#[test]
fn test_signal_releases_only_the_matching_parked_thread() {
    let gate = EventGate::new();
    gate.arm_breakpoint(0x4000);
    gate.arm_breakpoint(0x5000);

    thread::scope(|s| {
        let parked: Vec<_> = [T1, T2, T3]
            .into_iter()
            .map(|t| {
                let gate = &gate;
                s.spawn(move || gate.push_waiter(t).wait(Duration::from_secs(10)))
            })
            .collect();
        wait_until_parked(&gate, &[T1, T2, T3]);

        let hit = gate.on_breakpoint(T2, 0x4000);
        assert!(hit.released);
        let mut parked = parked.into_iter();
        let (h1, h2, h3) = (
            parked.next().unwrap(),
            parked.next().unwrap(),
            parked.next().unwrap(),
        );
        assert_eq!(
            h2.join().unwrap(),
            Ok(GateSignal::Breakpoint { address: 0x4000 })
        );

        // 他のスレッドの待機者は残っている
        assert_eq!(gate.pending(T1), 1);
        assert_eq!(gate.pending(T3), 1);
        assert!(!h1.is_finished());

        gate.on_breakpoint(T3, 0x5000);
        assert_eq!(
            h3.join().unwrap(),
            Ok(GateSignal::Breakpoint { address: 0x5000 })
        );

        gate.notify(
            T1,
            GateSignal::Stopped {
                reason: "SIGSEGV".into(),
            },
        );
        assert_eq!(
            h1.join().unwrap(),
            Ok(GateSignal::Stopped {
                reason: "SIGSEGV".into()
            })
        );
    });

    assert_eq!(gate.pending(T1), 0);
    assert_eq!(gate.pending(T2), 0);
}

#[test]
fn test_exit_releases_all_parked_threads() {
    let gate = EventGate::new();
    thread::scope(|s| {
        let handles: Vec<_> = [T1, T2]
            .into_iter()
            .map(|t| {
                let gate = &gate;
                s.spawn(move || gate.push_waiter(t).wait(Duration::from_secs(10)))
            })
            .collect();
        wait_until_parked(&gate, &[T1, T2]);

        gate.notify_exit(9);
        for handle in handles {
            assert_eq!(handle.join().unwrap(), Ok(GateSignal::Exited(9)));
        }
    });
}

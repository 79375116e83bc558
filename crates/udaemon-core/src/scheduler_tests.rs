
    use super::*;

    type Callback = Box<dyn FnMut(u32) -> TaskStatus>;

    fn table(capacity: usize) -> TaskTable<Callback> {
        TaskTable::new(capacity)
    }

    /// Fire every due task once, like a reactor iteration would.
    fn run_due(table: &mut TaskTable<Callback>, now: Instant) -> usize {
        let mut fired = 0;
        for index in 0..table.capacity() {
            if let Some((id, interval, mut callback)) = table.take_due(index, now) {
                let status = callback(interval);
                table.complete(id, callback, status, now);
                fired += 1;
            }
        }
        fired
    }

    #[test]
    fn test_status_from_int() {
        assert_eq!(TaskStatus::from(0), TaskStatus::Finished);
        assert_eq!(TaskStatus::from(-1), TaskStatus::Aborted);
        assert_eq!(TaskStatus::from(-42), TaskStatus::Aborted);
        assert_eq!(TaskStatus::from(8), TaskStatus::Reschedule(8));
    }

    #[test]
    fn test_schedule_sets_deadline() {
        let mut tasks = table(2);
        let now = Instant::now();
        let id = tasks
            .schedule(now, 5, Box::new(|_| TaskStatus::Finished))
            .unwrap();

        assert_eq!(tasks.deadline(id), Some(now + Duration::from_secs(5)));
        assert_eq!(tasks.interval(id), Some(5));
        assert_eq!(tasks.len(), 1);
    }

    #[test]
    fn test_not_fired_before_deadline() {
        let mut tasks = table(1);
        let now = Instant::now();
        tasks
            .schedule(now, 5, Box::new(|_| TaskStatus::Finished))
            .unwrap();

        assert_eq!(run_due(&mut tasks, now + Duration::from_secs(4)), 0);
        assert_eq!(tasks.len(), 1);
    }

    #[test]
    fn test_zero_interval_fires_when_observed() {
        let mut tasks = table(1);
        let now = Instant::now();
        tasks
            .schedule(now, 0, Box::new(|_| TaskStatus::Finished))
            .unwrap();

        assert_eq!(run_due(&mut tasks, now), 1);
        assert_eq!(tasks.len(), 0);
    }

    #[test]
    fn test_reschedule_rearms_from_fire_time() {
        let mut tasks = table(1);
        let now = Instant::now();
        let id = tasks
            .schedule(now, 5, Box::new(|_| TaskStatus::Reschedule(8)))
            .unwrap();

        let fire_time = now + Duration::from_secs(6);
        assert_eq!(run_due(&mut tasks, fire_time), 1);
        assert_eq!(tasks.interval(id), Some(8));
        assert_eq!(tasks.deadline(id), Some(fire_time + Duration::from_secs(8)));
    }

    #[test]
    fn test_callback_sees_current_interval() {
        use std::cell::RefCell;
        use std::rc::Rc;

        let seen = Rc::new(RefCell::new(Vec::new()));
        let log = seen.clone();
        let mut tasks = table(1);
        let now = Instant::now();
        tasks
            .schedule(
                now,
                0,
                Box::new(move |interval| {
                    log.borrow_mut().push(interval);
                    TaskStatus::Reschedule(if interval == 0 { 1 } else { interval * 2 })
                }),
            )
            .unwrap();

        let mut t = now;
        for _ in 0..4 {
            run_due(&mut tasks, t);
            t += Duration::from_secs(60);
        }
        assert_eq!(*seen.borrow(), vec![0, 1, 2, 4]);
    }

    #[test]
    fn test_finished_and_aborted_never_run_again() {
        use std::cell::Cell;
        use std::rc::Rc;

        for status in [TaskStatus::Finished, TaskStatus::Aborted] {
            let calls = Rc::new(Cell::new(0));
            let counter = calls.clone();
            let mut tasks = table(1);
            let now = Instant::now();
            tasks
                .schedule(
                    now,
                    0,
                    Box::new(move |_| {
                        counter.set(counter.get() + 1);
                        status
                    }),
                )
                .unwrap();

            run_due(&mut tasks, now);
            run_due(&mut tasks, now + Duration::from_secs(3600));
            assert_eq!(calls.get(), 1);
            assert_eq!(tasks.len(), 0);
        }
    }

    #[test]
    fn test_capacity_exhausted() {
        let mut tasks = table(2);
        let now = Instant::now();
        tasks.schedule(now, 1, Box::new(|_| TaskStatus::Finished)).unwrap();
        tasks.schedule(now, 1, Box::new(|_| TaskStatus::Finished)).unwrap();

        let err = tasks
            .schedule(now, 1, Box::new(|_| TaskStatus::Finished))
            .unwrap_err();
        assert!(matches!(
            err,
            RuntimeError::ResourceExhausted { table: "task", capacity: 2 }
        ));
    }

    #[test]
    fn test_slot_held_while_running() {
        let mut tasks = table(1);
        let now = Instant::now();
        let id = tasks
            .schedule(now, 0, Box::new(|_| TaskStatus::Finished))
            .unwrap();

        let (taken, _, callback) = tasks.take_due(0, now).unwrap();
        assert_eq!(taken, id);
        // Slot still occupied while the callback is out.
        assert!(tasks
            .schedule(now, 0, Box::new(|_| TaskStatus::Finished))
            .is_err());
        tasks.complete(taken, callback, TaskStatus::Finished, now);
        assert_eq!(tasks.len(), 0);
    }

    #[test]
    fn test_clear() {
        let mut tasks = table(3);
        let now = Instant::now();
        tasks.schedule(now, 10, Box::new(|_| TaskStatus::Finished)).unwrap();
        tasks.schedule(now, 20, Box::new(|_| TaskStatus::Finished)).unwrap();
        assert_eq!(tasks.clear(), 2);
        assert_eq!(tasks.len(), 0);
    }

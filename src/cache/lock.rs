use std::sync::{Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tracing::warn;

pub(crate) fn rw_read<'a, T>(
  lock: &'a RwLock<T>,
  target: &'static str,
  op: &'static str,
) -> RwLockReadGuard<'a, T> {
  lock.read().unwrap_or_else(|poisoned| {
    recovered(target, op, "rwlock.read");
    poisoned.into_inner()
  })
}

pub(crate) fn rw_write<'a, T>(
  lock: &'a RwLock<T>,
  target: &'static str,
  op: &'static str,
) -> RwLockWriteGuard<'a, T> {
  lock.write().unwrap_or_else(|poisoned| {
    recovered(target, op, "rwlock.write");
    poisoned.into_inner()
  })
}

pub(crate) fn mutex_lock<'a, T>(
  lock: &'a Mutex<T>,
  target: &'static str,
  op: &'static str,
) -> MutexGuard<'a, T> {
  lock.lock().unwrap_or_else(|poisoned| {
    recovered(target, op, "mutex.lock");
    poisoned.into_inner()
  })
}

fn recovered(target: &'static str, op: &'static str, lock_kind: &'static str) {
  warn!(
    op,
    target_module = target,
    lock_kind,
    result = "poisoned_recovered",
    "Recovered from poisoned lock; state may be stale after a panic in another task"
  );
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::panic::{catch_unwind, AssertUnwindSafe};

  #[test]
  fn test_write_recovers_from_poison() {
    let lock = RwLock::new(1);
    let _ = catch_unwind(AssertUnwindSafe(|| {
      let _guard = lock.write().unwrap();
      panic!("poison");
    }));
    assert!(lock.is_poisoned());

    *rw_write(&lock, "test", "write") = 2;
    assert_eq!(*rw_read(&lock, "test", "read"), 2);
  }
}

use std::sync::Condvar;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;

/// 获取睡眠锁，持锁者崩溃后依旧可用
#[inline]
pub fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// 在条件变量上等待，持锁者崩溃后依旧可用
#[inline]
pub fn wait<'a, T>(cond: &Condvar, guard: MutexGuard<'a, T>) -> MutexGuard<'a, T> {
    cond.wait(guard).unwrap_or_else(PoisonError::into_inner)
}

/// 计数信号量
///
/// 许可数以 `limit` 为上限，多余的 `up` 不会累积。
pub struct Semaphore {
    permits: Mutex<usize>,
    limit: usize,
    cond: Condvar,
}

impl Semaphore {
    pub fn new(permits: usize, limit: usize) -> Self {
        Self {
            permits: Mutex::new(permits.min(limit)),
            limit,
            cond: Condvar::new(),
        }
    }

    /// Verhogen 增加
    pub fn up(&self) {
        let mut permits = lock(&self.permits);
        *permits = (*permits + 1).min(self.limit);
        drop(permits);
        // 只唤醒一个等待者
        self.cond.notify_one();
    }

    /// Proberen 尝试
    pub fn down(&self) {
        let mut permits = lock(&self.permits);
        // 若资源派发完，则去排队
        while *permits == 0 {
            permits = self
                .cond
                .wait(permits)
                .unwrap_or_else(PoisonError::into_inner);
        }
        *permits -= 1;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;

    use super::*;

    #[test]
    fn up_is_capped() {
        let sem = Semaphore::new(0, 1);
        sem.up();
        sem.up();
        assert_eq!(*sem.permits.lock().unwrap(), 1);
    }

    #[test]
    fn down_blocks_until_up() {
        let sem = Arc::new(Semaphore::new(0, 4));
        let waiter = {
            let sem = Arc::clone(&sem);
            thread::spawn(move || sem.down())
        };
        sem.up();
        waiter.join().unwrap();
        assert_eq!(*sem.permits.lock().unwrap(), 0);
    }
}

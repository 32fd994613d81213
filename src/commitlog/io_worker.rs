use std::io;
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

pub const DEFAULT_STORAGE_TIMEOUT: Duration = Duration::from_secs(5);

type Job = Box<dyn FnOnce() + Send>;

/// IoWorker runs the file operations of one store on a dedicated thread, one at a time and in
/// submission order. Callers wait at most `timeout` for their result.
///
/// A job that times out keeps running. Jobs queued behind it still run after it, in order, so
/// each job must leave the file in a state the next job can work from.
pub(crate) struct IoWorker {
    jobs: mpsc::Sender<Job>,
    timeout: Duration,
}

impl IoWorker {
    pub(crate) fn spawn(name: &str, timeout: Duration) -> io::Result<Self> {
        let (jobs, queue) = mpsc::channel::<Job>();
        thread::Builder::new().name(name.to_string()).spawn(move || {
            // Ends when the owning store is dropped.
            for job in queue {
                job();
            }
        })?;

        Ok(IoWorker { jobs, timeout })
    }

    pub(crate) fn run<T, F>(&self, op: F) -> io::Result<T>
    where
        T: Send + 'static,
        F: FnOnce() -> io::Result<T> + Send + 'static,
    {
        let (reply_tx, reply_rx) = mpsc::sync_channel(1);
        let job: Job = Box::new(move || {
            // The caller may have timed out and left.
            let _ = reply_tx.send(op());
        });
        self.jobs
            .send(job)
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "storage worker has exited"))?;

        match reply_rx.recv_timeout(self.timeout) {
            Ok(result) => result,
            Err(mpsc::RecvTimeoutError::Timeout) => Err(io::Error::new(
                io::ErrorKind::TimedOut,
                format!("storage operation took longer than {:?}", self.timeout),
            )),
            Err(mpsc::RecvTimeoutError::Disconnected) => {
                Err(io::Error::new(io::ErrorKind::BrokenPipe, "storage worker dropped the operation"))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[test]
    fn stalled_job_times_out_and_later_jobs_keep_order() {
        let worker = IoWorker::spawn("test-io", Duration::from_millis(50)).unwrap();
        let order = Arc::new(Mutex::new(Vec::new()));

        let stalled = order.clone();
        let result = worker.run(move || {
            thread::sleep(Duration::from_millis(200));
            stalled.lock().unwrap().push("stalled");
            Ok(())
        });
        assert_eq!(result.unwrap_err().kind(), io::ErrorKind::TimedOut);

        // Queued behind the stalled job, so it times out too.
        let queued = order.clone();
        let result = worker.run(move || {
            queued.lock().unwrap().push("queued");
            Ok(())
        });
        assert_eq!(result.unwrap_err().kind(), io::ErrorKind::TimedOut);

        thread::sleep(Duration::from_millis(300));
        let after = order.clone();
        let value = worker
            .run(move || {
                after.lock().unwrap().push("after");
                Ok(7)
            })
            .unwrap();

        assert_eq!(value, 7);
        assert_eq!(*order.lock().unwrap(), vec!["stalled", "queued", "after"]);
    }

    #[test]
    fn errors_pass_through() {
        let worker = IoWorker::spawn("test-io", DEFAULT_STORAGE_TIMEOUT).unwrap();
        let result: io::Result<()> = worker.run(|| Err(io::Error::new(io::ErrorKind::Other, "disk on fire")));
        assert_eq!(result.unwrap_err().kind(), io::ErrorKind::Other);
    }
}

use std::future::Future;
use std::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::warn;

/// Work that outlives the event that started it, such as cache revalidation.
///
/// The host calls [`BackgroundTasks::settle`] before shutting down, the way a
/// browser keeps a worker alive until its `waitUntil` promises settle.
#[derive(Default)]
pub struct BackgroundTasks {
  handles: Mutex<Vec<JoinHandle<()>>>,
}

impl BackgroundTasks {
  pub fn spawn<F>(&self, task: F)
  where
    F: Future<Output = ()> + Send + 'static,
  {
    let handle = tokio::spawn(task);
    match self.handles.lock() {
      Ok(mut handles) => {
        handles.retain(|h| !h.is_finished());
        handles.push(handle);
      }
      // Untracked but still running
      Err(e) => warn!("Background task registry poisoned: {}", e),
    }
  }

  /// Wait until every spawned task, including ones spawned meanwhile, is done.
  pub async fn settle(&self) {
    loop {
      let pending: Vec<_> = match self.handles.lock() {
        Ok(mut handles) => handles.drain(..).collect(),
        Err(_) => return,
      };
      if pending.is_empty() {
        return;
      }
      for handle in pending {
        if let Err(e) = handle.await {
          warn!("Background task failed: {}", e);
        }
      }
    }
  }

  pub fn pending(&self) -> usize {
    self
      .handles
      .lock()
      .map(|handles| handles.iter().filter(|h| !h.is_finished()).count())
      .unwrap_or(0)
  }
}

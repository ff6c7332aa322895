use std::sync::{
	atomic::{AtomicBool, Ordering},
	Arc
};

use tokio::sync::Notify;

use crate::{DiffusionError, Result};

#[derive(Debug, Default)]
struct CancellationState {
	cancelled: AtomicBool,
	notify: Notify
}

/// A cloneable handle used to cancel long-running loads & runs.
///
/// All clones share the same flag. Cancelling wakes any task currently awaiting [`CancellationToken::cancelled`], so
/// in-flight model invocations are abandoned instead of completing.
///
/// ```ignore
/// let token = CancellationToken::new();
/// let handle = token.clone();
/// std::thread::spawn(move || {
/// 	std::thread::sleep(std::time::Duration::from_secs(5));
/// 	handle.cancel();
/// });
/// match pipeline.run(&options, None, &token).await {
/// 	Err(e) if e.is_cancelled() => println!("cancelled"),
/// 	other => { other?; }
/// }
/// ```
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
	state: Arc<CancellationState>
}

impl CancellationToken {
	/// Creates a new, uncancelled token.
	pub fn new() -> Self {
		Self::default()
	}

	/// Requests cancellation of every operation observing this token.
	pub fn cancel(&self) {
		self.state.cancelled.store(true, Ordering::SeqCst);
		self.state.notify.notify_waiters();
	}

	/// Returns `true` once [`CancellationToken::cancel`] has been called.
	pub fn is_cancelled(&self) -> bool {
		self.state.cancelled.load(Ordering::SeqCst)
	}

	/// Clears the cancellation flag so the token may be reused for a later run.
	pub fn reset(&self) {
		self.state.cancelled.store(false, Ordering::SeqCst);
	}

	/// Returns `Err(DiffusionError::Cancelled)` if cancellation was requested.
	pub fn check(&self) -> Result<()> {
		if self.is_cancelled() { Err(DiffusionError::Cancelled) } else { Ok(()) }
	}

	/// Completes once the token is cancelled.
	pub async fn cancelled(&self) {
		loop {
			// registered before the flag check so a concurrent `cancel` cannot be missed
			let notified = self.state.notify.notified();
			if self.is_cancelled() {
				return;
			}
			notified.await;
		}
	}
}

#[cfg(test)]
mod tests {
	use std::time::Duration;

	use super::CancellationToken;

	#[test]
	fn test_cancel_shared_between_clones() {
		let token = CancellationToken::new();
		let clone = token.clone();
		assert!(token.check().is_ok());
		clone.cancel();
		assert!(token.is_cancelled());
		assert!(token.check().unwrap_err().is_cancelled());
		token.reset();
		assert!(!clone.is_cancelled());
	}

	#[tokio::test]
	async fn test_cancelled_wakes_waiter() {
		let token = CancellationToken::new();
		let waiter = {
			let token = token.clone();
			tokio::spawn(async move { token.cancelled().await })
		};
		tokio::time::sleep(Duration::from_millis(10)).await;
		token.cancel();
		tokio::time::timeout(Duration::from_secs(1), waiter).await.unwrap().unwrap();
	}
}

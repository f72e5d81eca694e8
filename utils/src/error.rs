use core::result;

pub type Result<T = (), E = ()> = result::Result<T, E>;

#[doc(hidden)]
pub trait Ext<T, E> {
	/// Convert to an `Option`, handing the error to `f` (usually a logging closure).
	fn ok_or(self, f: impl FnOnce(E)) -> Option<T>;
}

impl<T, E> Ext<T, E> for result::Result<T, E> {
	fn ok_or(self, f: impl FnOnce(E)) -> Option<T> {
		match self {
			Ok(v) => Some(v),
			Err(e) => {
				f(e);
				None
			}
		}
	}
}

#[doc(hidden)]
pub trait ExtOpaque<T> {
	/// Pass the `Option` through, invoking `f` if it is `None`.
	fn some_or(self, f: impl FnOnce()) -> Option<T>;
}

impl<T> ExtOpaque<T> for Option<T> {
	fn some_or(self, f: impl FnOnce()) -> Option<T> {
		if self.is_none() {
			f();
		}

		self
	}
}

pub use Ext as _;

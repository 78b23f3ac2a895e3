use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Error)]
#[error("{kind}")]
pub struct Error {
  kind: ErrorKind,
}

impl Error {
  pub fn kind(&self) -> &ErrorKind {
    &self.kind
  }

  pub fn into_kind(self) -> ErrorKind {
    self.kind
  }
}

impl<E: Into<ErrorKind>> From<E> for Error {
  fn from(x: E) -> Self {
    Self { kind: x.into() }
  }
}

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ErrorKind {
  // -- Script --
  #[error("compile error: {0}")]
  Compile(String),

  #[error("script error: {0}")]
  Script(String),

  #[error("function '{0}' not found or not a function")]
  FunctionNotFound(String),

  // -- Value handle --
  #[error("cannot convert {from} into {to}")]
  TypeCoercion {
    from: &'static str,
    to: &'static str,
  },

  #[error("cannot access property '{key}': {reason}")]
  PropertyAccess { key: String, reason: String },

  #[error("value handle belongs to a different engine")]
  ForeignHandle,

  // -- Lifecycle --
  #[error("engine pool is shut down")]
  PoolClosed,

  #[error("no engine available")]
  PoolExhausted,

  #[error("engine executor has stopped")]
  ActorStopped,

  #[error("invalid configuration: {0}")]
  Config(String),

  // -- Vendor --
  #[error(transparent)]
  Lua(mlua::Error),

  #[error(transparent)]
  Io(#[from] std::io::Error),
}

impl From<mlua::Error> for ErrorKind {
  fn from(error: mlua::Error) -> Self {
    match error {
      mlua::Error::SyntaxError { message, .. } => Self::Compile(message),
      mlua::Error::RuntimeError(message) => Self::Script(message),
      error @ mlua::Error::CallbackError { .. } => {
        Self::Script(resolve_callback_error(&error).to_string())
      }
      error => Self::Lua(error),
    }
  }
}

impl From<Error> for mlua::Error {
  fn from(x: Error) -> Self {
    if let ErrorKind::Lua(x) = x.kind {
      x
    } else {
      mlua::Error::external(x)
    }
  }
}

/// Unwraps nested `CallbackError`s down to the original cause.
pub(crate) fn resolve_callback_error(error: &mlua::Error) -> &mlua::Error {
  match error {
    mlua::Error::CallbackError { cause, .. } => resolve_callback_error(cause),
    _ => error,
  }
}

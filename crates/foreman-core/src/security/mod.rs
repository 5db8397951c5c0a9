pub mod redact;
pub mod sandbox;

pub use redact::{SecretKind, SecretRedactor};
pub use sandbox::{validate_path, SandboxPolicy};

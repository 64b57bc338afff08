pub mod session;

pub use session::UserSession;

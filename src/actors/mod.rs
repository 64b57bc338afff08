pub mod connection_manager;
pub mod delivery_bus;
pub mod user_session;

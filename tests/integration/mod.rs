
mod coordinator_recovery;
mod ownership;
mod persistence_flow;
mod session_sync;

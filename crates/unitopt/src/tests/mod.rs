mod fallback;
mod wal_recovery;

//! End-to-end scenarios: a hub and threaded nodes over the in-memory mesh

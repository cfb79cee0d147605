// cliproxy - local multi-upstream reverse proxy for AI CLI clients
//
// Three family services (Claude / Codex / Legacy) run side by side on
// fixed local ports, sharing one pipeline: select an upstream config,
// transform the request, pace it under the config's RPM cap, forward it,
// stream the response back while logging usage, and evict upstreams that
// keep failing.
//
// Architecture:
// - server (axum): one router per family, websocket event feed
// - proxy: the request pipeline and streaming forwarder
// - adapter: family-specific paths, headers, and body backfill
// - pool / limiter: upstream selection, failure eviction, RPM pacing
// - storage: JSONL request log with realtime fan-out
// - config: JSON documents under ~/.clp

pub mod adapter;
pub mod cli;
pub mod config;
pub mod events;
pub mod family;
pub mod filter;
pub mod limiter;
pub mod parser;
pub mod pool;
pub mod proxy;
pub mod server;
pub mod storage;

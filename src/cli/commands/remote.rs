//! Protocol mode - serve git-annex on stdin/stdout

use crate::config::Config;
use crate::error::RemakeResult;
use crate::events::{AuditLog, EventSink, Fanout, TracingSink};
use crate::protocol::serve_stdio;
use std::sync::Arc;

/// Serve the special remote protocol until git-annex hangs up
pub async fn execute(config: Config) -> RemakeResult<()> {
    let sinks: Vec<Arc<dyn EventSink>> = vec![Arc::new(AuditLog::new(&config)), Arc::new(TracingSink)];
    serve_stdio(config, Arc::new(Fanout(sinks))).await
}

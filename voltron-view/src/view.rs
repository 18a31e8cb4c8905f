// View follow loop
//
// One immediate snapshot, then either a blocking request per stop or a
// fixed poll interval.

use crate::client::Client;
use anyhow::{anyhow, Result};
use std::time::Duration;
use tracing::{info, warn};
use voltron_core::{Config, PluginRegistry, Request, RequestKind, Response, ViewKind};

#[derive(Debug)]
pub struct Follow {
    view: ViewKind,
    request: RequestKind,
    poll: Option<Duration>,
    count: Option<usize>,
}

impl Follow {
    pub fn new(name: &str, config: &Config, poll_ms: Option<u64>, count: Option<usize>) -> Result<Self> {
        let registry = PluginRegistry::register_plugins()?;
        let view = registry
            .view(name)
            .ok_or_else(|| anyhow!("Unknown view kind: {}", name))?
            .kind;
        Ok(Self {
            view,
            request: view.request(&config.view),
            poll: poll_ms.filter(|ms| *ms > 0).map(Duration::from_millis),
            count,
        })
    }

    /// The request for update number `n`
    fn next_request(&self, n: usize) -> Request {
        if n == 0 || self.poll.is_some() {
            Request::new(self.request.clone())
        } else {
            Request::blocking(self.request.clone())
        }
    }

    pub async fn run(self, mut client: Client) -> Result<()> {
        info!("following {} view", self.view);
        let mut n = 0;
        while self.count.map_or(true, |count| n < count) {
            let response = client.call(self.next_request(n)).await?;
            print(&response)?;
            n += 1;
            if let Some(interval) = self.poll {
                tokio::time::sleep(interval).await;
            }
        }
        Ok(())
    }
}

fn print(response: &Response) -> Result<()> {
    if let Some(kind) = response.error_kind {
        warn!("server error {}: {}", kind, response.body["message"]);
    }
    println!("{}", serde_json::to_string(response)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use voltron_core::protocol::Address;

    #[test]
    fn test_follow_resolves_alias() {
        let config = Config::default();
        let follow = Follow::new("dis", &config, None, Some(2)).unwrap();
        assert_eq!(follow.view, ViewKind::Disassembly);
        assert_eq!(
            follow.request,
            RequestKind::Disassemble { address: Address::ProgramCounter, count: config.view.disassembly_count }
        );
        assert!(!follow.next_request(0).block);
        assert!(follow.next_request(1).block);

        assert!(Follow::new("nope", &config, None, None).is_err());
    }

    #[test]
    fn test_poll_never_blocks() {
        let follow = Follow::new("regs", &Config::default(), Some(100), None).unwrap();
        assert!(!follow.next_request(5).block);
        let follow = Follow::new("regs", &Config::default(), Some(0), None).unwrap();
        assert!(follow.next_request(5).block);
    }
}

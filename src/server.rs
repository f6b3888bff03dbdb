use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use relay::{Broker, RuleTable};
use tokio::{sync::mpsc, time::sleep};

use crate::{config::Config, store::RuleStore};

/// How many times in a row the broker may fail to come up before the
/// process gives up.
const START_ATTEMPTS: u32 = 5;

/// Supervise the broker.
///
/// Every generation gets its own copy of the rule table, so a running
/// broker never sees a half-applied edit. A restart signal (fired by the
/// rule store after every mutation) recycles the generation cleanly:
/// the old broker closes, parked backend sockets close with it, and the
/// next generation starts from a fresh snapshot. Start failures are
/// retried after a one second pause; too many in a row end the process.
pub async fn run(
    config: Arc<Config>,
    store: Arc<RuleStore>,
    mut restarts: mpsc::Receiver<()>,
) -> Result<()> {
    let mut failures = 0;

    loop {
        match generation(&config, &store, &mut restarts).await {
            Ok(()) => {
                log::info!("broker restarting: listen={}", config.listen);
                failures = 0;
            }
            Err(error) => {
                failures += 1;
                log::error!("broker start failed: attempt={failures}, err={error}");

                if failures >= START_ATTEMPTS {
                    return Err(error)
                        .with_context(|| format!("broker gave up after {failures} attempts"));
                }

                sleep(Duration::from_secs(1)).await;
            }
        }
    }
}

/// One broker generation: serve until a restart is requested. A clean
/// close is `Ok`; anything else counts against the retry budget.
async fn generation(
    config: &Config,
    store: &RuleStore,
    restarts: &mut mpsc::Receiver<()>,
) -> Result<()> {
    // A restart queued before this generation even started is already
    // covered by the snapshot taken below.
    while restarts.try_recv().is_ok() {}

    let rules = RuleTable::new(store.snapshot())?;
    let broker = Arc::new(Broker::new(rules));

    tokio::select! {
        result = broker.clone().serve(config.listen) => Ok(result?),
        _ = restarts.recv() => {
            broker.close();
            Ok(())
        }
    }
}

use chrono::Utc;
use futures_util::future::join_all;
use scrobble_proto::protocol::{CycleId, CycleResult, UserFetchResult};
use scrobble_proto::settings::Settings;
use tracing::warn;

use crate::fetch::{FetchRequest, Fetcher};

/// Fetch every tracked user concurrently and wait for all of them.
///
/// `join_all` yields outputs in the order the futures were given, so the
/// results line up with `settings.tracked_users` however the requests finish.
pub async fn run_cycle(fetcher: &dyn Fetcher, settings: &Settings, cycle_id: CycleId) -> CycleResult {
    let requests: Vec<FetchRequest> = settings
        .tracked_users
        .iter()
        .map(|user| FetchRequest {
            user: user.clone(),
            credential: settings.credential.clone(),
            limit: settings.fetch_limit,
        })
        .collect();

    let results = join_all(requests.iter().map(|req| fetch_one(fetcher, req))).await;

    CycleResult {
        cycle_id,
        results,
        completed_at: Utc::now(),
    }
}

async fn fetch_one(fetcher: &dyn Fetcher, req: &FetchRequest) -> UserFetchResult {
    match fetcher.fetch(req).await {
        Ok(result) => result,
        Err(e) => {
            warn!("cycle: fetch for {} could not start: {}", req.user, e);
            UserFetchResult::failed(&req.user, e.to_string())
        }
    }
}

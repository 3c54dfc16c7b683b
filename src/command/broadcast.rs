use super::{Opened, print_json};
use crate::args::{Broadcast, BroadcastSend};
use engine::api::Recipients;

pub(crate) async fn broadcast(opened: &Opened, command: Broadcast) -> Result<(), anyhow::Error> {
    let api = &opened.engine.api;
    match command {
        Broadcast::Send(BroadcastSend {
            text,
            all,
            recipient,
            issued_by,
        }) => {
            let recipients = if all {
                Recipients::Keyword("all".to_string())
            } else {
                Recipients::Ids(recipient)
            };
            print_json(&api.broadcast(&text, recipients, &issued_by).await?)
        }
        Broadcast::Log { limit } => print_json(&api.broadcast_log(limit).await),
    }
}

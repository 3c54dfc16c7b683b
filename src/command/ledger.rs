use super::{Opened, print_json};
use crate::args::Ledger;

pub(crate) async fn ledger(opened: &Opened, command: Ledger) -> Result<(), anyhow::Error> {
    let api = &opened.engine.api;
    match command {
        Ledger::Check {
            recipient_id,
            tracking_parts,
        } => print_json(&api.check_sent(&recipient_id, &tracking_parts).await?),
        Ledger::Mark {
            recipient_id,
            tracking_parts,
            device_id,
        } => print_json(
            &api
                .mark_sent(&recipient_id, &tracking_parts, device_id.as_deref())
                .await?,
        ),
        Ledger::History { recipient_id } => print_json(&api.history(&recipient_id).await?),
    }
}

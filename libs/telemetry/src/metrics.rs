use metrics::counter;

pub const WEBHOOK_DELIVERIES_TOTAL: &str = "webhook_deliveries_total";
pub const WEBHOOK_QUEUE_REJECTIONS_TOTAL: &str = "webhook_queue_rejections_total";
pub const XMPP_INBOUND_DROPPED_TOTAL: &str = "xmpp_inbound_dropped_total";
pub const XMPP_RECONNECT_ATTEMPTS_TOTAL: &str = "xmpp_reconnect_attempts_total";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Success,
    Failure,
}

impl DeliveryOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            DeliveryOutcome::Success => "success",
            DeliveryOutcome::Failure => "failure",
        }
    }
}

pub fn record_webhook_delivery(outcome: DeliveryOutcome, test_mode: bool) {
    counter!(
        WEBHOOK_DELIVERIES_TOTAL,
        "outcome" => outcome.as_str(),
        "test_mode" => if test_mode { "true" } else { "false" }
    )
    .increment(1);
}

pub fn record_queue_rejection() {
    counter!(WEBHOOK_QUEUE_REJECTIONS_TOTAL).increment(1);
}

pub fn record_inbound_dropped(client: &str) {
    counter!(XMPP_INBOUND_DROPPED_TOTAL, "client" => client.to_string()).increment(1);
}

pub fn record_reconnect_attempt(client: &str) {
    counter!(XMPP_RECONNECT_ATTEMPTS_TOTAL, "client" => client.to_string()).increment(1);
}

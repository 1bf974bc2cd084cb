//! td-broker-rest — generic REST broker adapter.
//!
//! Speaks a JSON-over-HTTPS order API of the shape most retail brokers
//! expose: token login, `POST/PUT/DELETE /orders`, read endpoints for
//! orders/positions/holdings. Lifecycle events are synthesized by polling
//! the order list and diffing against the last observed snapshot — venues
//! without a push stream still feed the same event pipeline.
//!
//! The adapter owns:
//! - bearer-token renewal ahead of expiry
//! - a per-broker token bucket applied before every RPC
//! - deadline + retry (idempotent reads only) via `td-broker`
//! - normalization of wire enums; unknown values are logged and skipped

use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::mpsc;
use tokio::time::Instant;

use td_broker::{
    retry_idempotent, with_deadline, BrokerAdapter, BrokerError, BrokerEvent, BrokerEventKind,
    BrokerHoldingSnapshot, BrokerOrderSnapshot, BrokerPositionSnapshot, ModifyRequest,
    RetryPolicy, TokenBucket,
};
use td_schemas::{Order, OrderState};

mod wire;

pub use wire::{amount_from_wire, amount_to_wire};

use wire::{
    enum_wire, holding_snapshot_from_wire, order_snapshot_from_wire, position_snapshot_from_wire,
    product_to_wire, side_to_wire, ApiError, ModifyOrderRequest, PlaceOrderRequest,
    PlaceOrderResponse, TokenRequest, TokenResponse, WireHolding, WireOrder, WirePosition,
};

const EVENT_CAPACITY: usize = 1024;
/// Renew the bearer this long before its stated expiry.
const TOKEN_RENEWAL_SLACK: Duration = Duration::from_secs(60);

#[derive(Clone, Debug)]
pub struct RestBrokerConfig {
    pub broker_id: String,
    pub base_url: String,
    pub api_key: String,
    pub api_secret: String,
    pub rpc_deadline: Duration,
    pub retry: RetryPolicy,
    pub rate_limit_capacity: u32,
    pub rate_limit_refill_per_sec: u32,
    pub event_poll_interval: Duration,
}

struct AuthState {
    token: Option<String>,
    expires_at: Instant,
}

pub struct RestBroker {
    cfg: RestBrokerConfig,
    http: reqwest::Client,
    bucket: TokenBucket,
    auth: Mutex<AuthState>,
}

impl RestBroker {
    pub fn new(cfg: RestBrokerConfig) -> Self {
        let bucket = TokenBucket::new(cfg.rate_limit_capacity, cfg.rate_limit_refill_per_sec);
        Self {
            cfg,
            http: reqwest::Client::new(),
            bucket,
            auth: Mutex::new(AuthState {
                token: None,
                expires_at: Instant::now(),
            }),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.cfg.base_url.trim_end_matches('/'))
    }

    fn cached_token(&self) -> Option<String> {
        let auth = self.auth.lock().ok()?;
        let valid = auth.expires_at > Instant::now() + TOKEN_RENEWAL_SLACK;
        if valid {
            auth.token.clone()
        } else {
            None
        }
    }

    /// Return a valid bearer token, renewing through the login endpoint when
    /// the cached one is missing or close to expiry.
    async fn bearer(&self) -> Result<String, BrokerError> {
        if let Some(t) = self.cached_token() {
            return Ok(t);
        }

        self.bucket.acquire().await;
        let resp = self
            .http
            .post(self.url("/session/token"))
            .json(&TokenRequest {
                api_key: &self.cfg.api_key,
                api_secret: &self.cfg.api_secret,
            })
            .send()
            .await
            .map_err(transport_error)?;
        let resp = check_status(resp).await?;
        let tok: TokenResponse = resp.json().await.map_err(transport_error)?;

        if let Ok(mut auth) = self.auth.lock() {
            auth.token = Some(tok.access_token.clone());
            auth.expires_at = Instant::now() + Duration::from_secs(tok.expires_in_secs);
        }
        tracing::debug!(broker_id = %self.cfg.broker_id, "bearer token renewed");
        Ok(tok.access_token)
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<T, BrokerError> {
        let token = self.bearer().await?;
        self.bucket.acquire().await;
        let resp = self
            .http
            .get(self.url(path))
            .bearer_auth(token)
            .send()
            .await
            .map_err(transport_error)?;
        let resp = check_status(resp).await?;
        resp.json().await.map_err(transport_error)
    }
}

/// Classify HTTP outcomes: 2xx pass through, 4xx are venue rejects (the
/// request reached the broker and was refused), everything else is
/// transient.
async fn check_status(resp: reqwest::Response) -> Result<reqwest::Response, BrokerError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    let reason = match serde_json::from_str::<ApiError>(&body) {
        Ok(e) => format!("{}: {}", e.code, e.message),
        Err(_) => format!("http {status}: {body}"),
    };
    if status.is_client_error() && status != reqwest::StatusCode::TOO_MANY_REQUESTS {
        Err(BrokerError::Reject { reason })
    } else {
        Err(BrokerError::Transient { reason })
    }
}

fn transport_error(e: reqwest::Error) -> BrokerError {
    BrokerError::Transient {
        reason: e.to_string(),
    }
}

#[async_trait]
impl BrokerAdapter for RestBroker {
    fn broker_id(&self) -> &str {
        &self.cfg.broker_id
    }

    async fn place(&self, order: &Order) -> Result<String, BrokerError> {
        let token = self.bearer().await?;
        self.bucket.acquire().await;

        let req = PlaceOrderRequest {
            exchange: order.instrument.exchange.clone(),
            symbol: order.instrument.symbol.clone(),
            side: side_to_wire(order.side).to_string(),
            order_type: enum_wire(&order.order_type),
            validity: enum_wire(&order.validity),
            product: product_to_wire(order.product).to_string(),
            quantity: order.qty,
            price: order.price.map(amount_to_wire),
            trigger_price: order.trigger_price.map(amount_to_wire),
            client_ref: order.order_id.to_string(),
        };

        // Non-idempotent: one attempt under the deadline, no retry.
        let resp = with_deadline(self.cfg.rpc_deadline, async {
            let resp = self
                .http
                .post(self.url("/orders"))
                .bearer_auth(token)
                .json(&req)
                .send()
                .await
                .map_err(transport_error)?;
            let resp = check_status(resp).await?;
            resp.json::<PlaceOrderResponse>()
                .await
                .map_err(transport_error)
        })
        .await?;

        Ok(resp.order_id)
    }

    async fn modify(
        &self,
        broker_order_id: &str,
        change: &ModifyRequest,
    ) -> Result<(), BrokerError> {
        let token = self.bearer().await?;
        self.bucket.acquire().await;

        let req = ModifyOrderRequest {
            quantity: change.qty,
            price: change.price.map(amount_to_wire),
            trigger_price: change.trigger_price.map(amount_to_wire),
        };

        with_deadline(self.cfg.rpc_deadline, async {
            let resp = self
                .http
                .put(self.url(&format!("/orders/{broker_order_id}")))
                .bearer_auth(token)
                .json(&req)
                .send()
                .await
                .map_err(transport_error)?;
            check_status(resp).await.map(|_| ())
        })
        .await
    }

    async fn cancel(&self, broker_order_id: &str) -> Result<(), BrokerError> {
        let token = self.bearer().await?;
        self.bucket.acquire().await;

        with_deadline(self.cfg.rpc_deadline, async {
            let resp = self
                .http
                .delete(self.url(&format!("/orders/{broker_order_id}")))
                .bearer_auth(token)
                .send()
                .await
                .map_err(transport_error)?;
            check_status(resp).await.map(|_| ())
        })
        .await
    }

    async fn fetch_open_orders(&self) -> Result<Vec<BrokerOrderSnapshot>, BrokerError> {
        let rows: Vec<WireOrder> =
            retry_idempotent(self.cfg.retry, "fetch_open_orders", || {
                self.get_json("/orders")
            })
            .await?;
        Ok(rows
            .iter()
            .filter_map(|w| {
                let snap = order_snapshot_from_wire(w);
                if snap.is_none() {
                    tracing::warn!(order_id = %w.order_id, status = %w.status, "unmappable wire order skipped");
                }
                snap
            })
            .collect())
    }

    async fn fetch_positions(&self) -> Result<Vec<BrokerPositionSnapshot>, BrokerError> {
        let rows: Vec<WirePosition> =
            retry_idempotent(self.cfg.retry, "fetch_positions", || {
                self.get_json("/positions")
            })
            .await?;
        Ok(rows.iter().filter_map(position_snapshot_from_wire).collect())
    }

    async fn fetch_holdings(&self) -> Result<Vec<BrokerHoldingSnapshot>, BrokerError> {
        let rows: Vec<WireHolding> =
            retry_idempotent(self.cfg.retry, "fetch_holdings", || {
                self.get_json("/holdings")
            })
            .await?;
        Ok(rows.iter().map(holding_snapshot_from_wire).collect())
    }

    async fn subscribe_events(&self) -> Result<mpsc::Receiver<BrokerEvent>, BrokerError> {
        let (tx, rx) = mpsc::channel(EVENT_CAPACITY);

        // Polling bridge: diff successive order snapshots into events.
        let poller = RestBroker::new(self.cfg.clone());
        let broker_id = self.cfg.broker_id.clone();
        let interval = self.cfg.event_poll_interval;

        tokio::spawn(async move {
            let mut last: BTreeMap<String, BrokerOrderSnapshot> = BTreeMap::new();
            let mut seqs: BTreeMap<String, u64> = BTreeMap::new();
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                ticker.tick().await;
                let snaps = match poller.fetch_open_orders().await {
                    Ok(s) => s,
                    Err(e) => {
                        tracing::warn!(broker_id, error = %e, "event poll failed");
                        continue;
                    }
                };

                for snap in snaps {
                    let evs = diff_to_events(&broker_id, last.get(&snap.broker_order_id), &snap, &mut seqs);
                    last.insert(snap.broker_order_id.clone(), snap);
                    for ev in evs {
                        if tx.send(ev).await.is_err() {
                            // Subscriber gone; stop polling.
                            return;
                        }
                    }
                }
            }
        });

        Ok(rx)
    }
}

/// Turn an observed snapshot change into lifecycle events.
fn diff_to_events(
    broker_id: &str,
    prev: Option<&BrokerOrderSnapshot>,
    cur: &BrokerOrderSnapshot,
    seqs: &mut BTreeMap<String, u64>,
) -> Vec<BrokerEvent> {
    let mut kinds: Vec<BrokerEventKind> = Vec::new();

    let prev_state = prev.map(|p| p.state);
    let prev_filled = prev.map(|p| p.filled_qty).unwrap_or(0);
    let fill_delta = cur.filled_qty - prev_filled;
    let fill_price = cur.avg_fill_price.unwrap_or(td_schemas::Amount::ZERO);

    if prev.is_none() {
        kinds.push(BrokerEventKind::Ack);
    }

    match cur.state {
        OrderState::PartiallyFilled if fill_delta > 0 => {
            kinds.push(BrokerEventKind::PartialFill {
                fill_id: fill_id(&cur.broker_order_id, cur.filled_qty),
                qty: fill_delta,
                price: fill_price,
            });
        }
        OrderState::Filled if prev_state != Some(OrderState::Filled) => {
            kinds.push(BrokerEventKind::Fill {
                fill_id: fill_id(&cur.broker_order_id, cur.filled_qty),
                qty: fill_delta.max(0),
                price: fill_price,
            });
        }
        OrderState::Cancelled if prev_state != Some(OrderState::Cancelled) => {
            kinds.push(BrokerEventKind::Cancelled);
        }
        OrderState::Rejected if prev_state != Some(OrderState::Rejected) => {
            kinds.push(BrokerEventKind::Reject {
                reason: "rejected at venue".into(),
            });
        }
        OrderState::Expired if prev_state != Some(OrderState::Expired) => {
            kinds.push(BrokerEventKind::Expired);
        }
        _ => {}
    }

    kinds
        .into_iter()
        .map(|kind| {
            let seq = seqs.entry(cur.broker_order_id.clone()).or_insert(0);
            *seq += 1;
            BrokerEvent {
                broker_id: broker_id.to_string(),
                broker_order_id: cur.broker_order_id.clone(),
                seq: *seq,
                kind,
                ts: Utc::now(),
            }
        })
        .collect()
}

/// Deterministic synthetic fill id: poll-based events have no venue fill id,
/// so cumulative filled qty disambiguates.
fn fill_id(broker_order_id: &str, cum_filled: i64) -> String {
    format!("{broker_order_id}-cum{cum_filled}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use td_schemas::{Amount, InstrumentKey, Side};

    fn snap(state: OrderState, filled: i64) -> BrokerOrderSnapshot {
        BrokerOrderSnapshot {
            broker_order_id: "R-1".into(),
            instrument: InstrumentKey::new("NSE", "SBIN"),
            side: Side::Buy,
            state,
            qty: 100,
            filled_qty: filled,
            avg_fill_price: Some(Amount::from_rupees(500)),
            price: Some(Amount::from_rupees(500)),
        }
    }

    #[test]
    fn first_observation_emits_ack() {
        let mut seqs = BTreeMap::new();
        let evs = diff_to_events("rest", None, &snap(OrderState::Submitted, 0), &mut seqs);
        assert_eq!(evs.len(), 1);
        assert_eq!(evs[0].kind, BrokerEventKind::Ack);
        assert_eq!(evs[0].seq, 1);
    }

    #[test]
    fn filled_delta_becomes_partial_fill_event() {
        let mut seqs = BTreeMap::new();
        let prev = snap(OrderState::Submitted, 0);
        let evs = diff_to_events(
            "rest",
            Some(&prev),
            &snap(OrderState::PartiallyFilled, 40),
            &mut seqs,
        );
        assert!(matches!(
            evs[0].kind,
            BrokerEventKind::PartialFill { qty: 40, .. }
        ));
    }

    #[test]
    fn completion_emits_fill_once() {
        let mut seqs = BTreeMap::new();
        let prev = snap(OrderState::PartiallyFilled, 40);
        let evs = diff_to_events("rest", Some(&prev), &snap(OrderState::Filled, 100), &mut seqs);
        assert!(matches!(evs[0].kind, BrokerEventKind::Fill { qty: 60, .. }));

        // Same state again: no duplicate event.
        let prev = snap(OrderState::Filled, 100);
        let evs = diff_to_events("rest", Some(&prev), &snap(OrderState::Filled, 100), &mut seqs);
        assert!(evs.is_empty());
    }

    #[test]
    fn cancel_observed_once() {
        let mut seqs = BTreeMap::new();
        let prev = snap(OrderState::Submitted, 0);
        let evs = diff_to_events("rest", Some(&prev), &snap(OrderState::Cancelled, 0), &mut seqs);
        assert_eq!(evs[0].kind, BrokerEventKind::Cancelled);
        assert_eq!(evs[0].seq, 1);
    }
}

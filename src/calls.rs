//! Call-ID をキーに B2BUA の通話状態を管理するマネージャ。
//! 終了処理は必ず `end` を通し、履歴への追記とアクティブ表からの除去を一箇所で行う。

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::Mutex;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

const HISTORY_CAP: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CallState {
    Initiated,
    Ringing,
    Established,
    Terminating,
    Terminated,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EndReason {
    Normal,
    Rejected(u16),
    Timeout,
    Error(String),
}

#[derive(Debug, Error)]
pub enum CallError {
    #[error("no call for Call-ID {0}")]
    NotFound(String),
    #[error("call {call_id} already exists")]
    AlreadyExists { call_id: String },
    #[error("invalid state transition from {from:?} to {to:?}")]
    InvalidTransition { from: CallState, to: CallState },
}

/// 発側 INVITE から写し取ったヘッダ。最終応答を発側に返すときにそのまま使う。
#[derive(Debug, Clone, Default)]
pub struct PreservedHeaders {
    pub via: String,
    pub from: String,
    pub to: String,
    pub cseq: String,
    pub contact: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct Call {
    pub call_id: String,
    pub from_number: String,
    pub to_number: String,
    pub from_transport: SocketAddr,
    pub to_transport: Option<SocketAddr>,
    pub from_rtp_port: Option<u16>,
    pub to_rtp_port: Option<u16>,
    #[serde(skip)]
    pub preserved: PreservedHeaders,
    pub state: CallState,
    pub invite_time: DateTime<Utc>,
    pub answer_time: Option<DateTime<Utc>>,
    pub waiting_for_ack: bool,
}

impl Call {
    fn transition(&mut self, to: CallState) -> Result<(), CallError> {
        use CallState::*;
        let allowed = matches!(
            (self.state, to),
            (Initiated, Ringing)
                | (Initiated, Established)
                | (Initiated, Terminating)
                | (Initiated, Terminated)
                | (Ringing, Established)
                | (Ringing, Terminating)
                | (Ringing, Terminated)
                | (Established, Terminating)
                | (Established, Terminated)
                | (Terminating, Terminated)
        );
        if !allowed {
            return Err(CallError::InvalidTransition {
                from: self.state,
                to,
            });
        }
        self.state = to;
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CallRecord {
    pub id: String,
    pub call_id: String,
    pub from_number: String,
    pub to_number: String,
    pub invite_time: DateTime<Utc>,
    pub answer_time: Option<DateTime<Utc>>,
    pub end_time: DateTime<Utc>,
    pub duration_seconds: u64,
    pub reason: EndReason,
}

#[derive(Debug, Clone, Serialize)]
pub struct CallStatistics {
    pub active: usize,
    pub ringing: usize,
    pub established: usize,
    pub terminating: usize,
    pub completed: usize,
}

pub struct CallManager {
    active: Mutex<HashMap<String, Call>>,
    history: Mutex<VecDeque<CallRecord>>,
    setup_timeout: StdDuration,
}

impl CallManager {
    pub fn new(setup_timeout: StdDuration) -> Self {
        Self {
            active: Mutex::new(HashMap::new()),
            history: Mutex::new(VecDeque::new()),
            setup_timeout,
        }
    }

    pub fn create(
        &self,
        call_id: &str,
        from_number: &str,
        to_number: &str,
        from_transport: SocketAddr,
        preserved: PreservedHeaders,
    ) -> Result<Call, CallError> {
        let mut map = self.active.lock().unwrap();
        if map.contains_key(call_id) {
            return Err(CallError::AlreadyExists {
                call_id: call_id.to_string(),
            });
        }
        let call = Call {
            call_id: call_id.to_string(),
            from_number: from_number.to_string(),
            to_number: to_number.to_string(),
            from_transport,
            to_transport: None,
            from_rtp_port: None,
            to_rtp_port: None,
            preserved,
            state: CallState::Initiated,
            invite_time: Utc::now(),
            answer_time: None,
            waiting_for_ack: false,
        };
        map.insert(call_id.to_string(), call.clone());
        Ok(call)
    }

    fn with_call<R>(
        &self,
        call_id: &str,
        f: impl FnOnce(&mut Call) -> Result<R, CallError>,
    ) -> Result<R, CallError> {
        let mut map = self.active.lock().unwrap();
        let call = map
            .get_mut(call_id)
            .ok_or_else(|| CallError::NotFound(call_id.to_string()))?;
        f(call)
    }

    /// 着側バインディングが決まった時点で呼び出す。RINGING へ遷移する。
    pub fn set_target(&self, call_id: &str, to_transport: SocketAddr) -> Result<(), CallError> {
        self.with_call(call_id, |call| {
            call.to_transport = Some(to_transport);
            call.transition(CallState::Ringing)
        })
    }

    pub fn set_from_rtp_port(&self, call_id: &str, port: u16) -> Result<(), CallError> {
        self.with_call(call_id, |call| {
            call.from_rtp_port = Some(port);
            Ok(())
        })
    }

    pub fn set_to_rtp_port(&self, call_id: &str, port: u16) -> Result<(), CallError> {
        self.with_call(call_id, |call| {
            call.to_rtp_port = Some(port);
            Ok(())
        })
    }

    /// 着側の 200 OK を発側へ中継した時点で ESTABLISHED にする。
    pub fn answer(&self, call_id: &str) -> Result<(), CallError> {
        self.with_call(call_id, |call| {
            call.transition(CallState::Established)?;
            call.answer_time = Some(Utc::now());
            call.waiting_for_ack = true;
            Ok(())
        })
    }

    pub fn ack_received(&self, call_id: &str) -> Result<(), CallError> {
        self.with_call(call_id, |call| {
            call.waiting_for_ack = false;
            Ok(())
        })
    }

    /// BYE を観測した側の印。相手側の 200 OK で `end` が閉じる。
    pub fn mark_terminating(&self, call_id: &str) -> Result<(), CallError> {
        self.with_call(call_id, |call| call.transition(CallState::Terminating))
    }

    /// 通話を閉じ、履歴へ移してアクティブ表から外す。
    pub fn end(&self, call_id: &str, reason: EndReason) -> Option<CallRecord> {
        let call = {
            let mut map = self.active.lock().unwrap();
            let mut call = map.remove(call_id)?;
            // 遷移チェックは通すが、どの状態からでも終了は許す
            let _ = call.transition(CallState::Terminated);
            call
        };

        let end_time = Utc::now();
        let duration_seconds = call
            .answer_time
            .map(|answered| (end_time - answered).num_seconds().max(0) as u64)
            .unwrap_or(0);
        let record = CallRecord {
            id: uuid::Uuid::new_v4().to_string(),
            call_id: call.call_id.clone(),
            from_number: call.from_number.clone(),
            to_number: call.to_number.clone(),
            invite_time: call.invite_time,
            answer_time: call.answer_time,
            end_time,
            duration_seconds,
            reason,
        };

        let mut history = self.history.lock().unwrap();
        if history.len() == HISTORY_CAP {
            history.pop_front();
        }
        history.push_back(record.clone());
        Some(record)
    }

    pub fn get(&self, call_id: &str) -> Option<Call> {
        self.active.lock().unwrap().get(call_id).cloned()
    }

    /// 通話中判定。RINGING/ESTABLISHED のどちらかの役で現れる番号は busy。
    pub fn is_number_busy(&self, number: &str) -> bool {
        let map = self.active.lock().unwrap();
        map.values().any(|call| {
            matches!(call.state, CallState::Ringing | CallState::Established)
                && (call.from_number == number || call.to_number == number)
        })
    }

    pub fn calls_by_number(&self, number: &str) -> Vec<Call> {
        let map = self.active.lock().unwrap();
        map.values()
            .filter(|call| call.from_number == number || call.to_number == number)
            .cloned()
            .collect()
    }

    pub fn active_calls(&self) -> Vec<Call> {
        let map = self.active.lock().unwrap();
        let mut calls: Vec<Call> = map.values().cloned().collect();
        calls.sort_by(|a, b| a.invite_time.cmp(&b.invite_time));
        calls
    }

    pub fn history(&self, limit: usize, offset: usize) -> Vec<CallRecord> {
        let history = self.history.lock().unwrap();
        history.iter().rev().skip(offset).take(limit).cloned().collect()
    }

    pub fn statistics(&self) -> CallStatistics {
        let map = self.active.lock().unwrap();
        let count = |state: CallState| map.values().filter(|c| c.state == state).count();
        CallStatistics {
            active: map.len(),
            ringing: count(CallState::Ringing),
            established: count(CallState::Established),
            terminating: count(CallState::Terminating),
            completed: self.history.lock().unwrap().len(),
        }
    }

    /// INITIATED のまま setup_timeout を超えた通話を TIMEOUT で閉じる。
    /// 閉じた Call-ID の一覧を返す（呼び出し側で RTP ストリームを掃除する）。
    pub fn cleanup(&self) -> Vec<String> {
        let now = Utc::now();
        let timeout_ms = self.setup_timeout.as_millis() as i64;
        let stale: Vec<String> = {
            let map = self.active.lock().unwrap();
            map.values()
                .filter(|call| {
                    call.state == CallState::Initiated
                        && (now - call.invite_time).num_milliseconds() >= timeout_ms
                })
                .map(|call| call.call_id.clone())
                .collect()
        };

        for call_id in &stale {
            self.end(call_id, EndReason::Timeout);
        }
        stale
    }

    pub fn clear(&self) -> usize {
        let call_ids: Vec<String> = {
            let map = self.active.lock().unwrap();
            map.keys().cloned().collect()
        };
        for call_id in &call_ids {
            self.end(call_id, EndReason::Error("cleared by operator".to_string()));
        }
        call_ids.len()
    }
}

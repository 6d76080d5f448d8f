use std::collections::{BTreeSet, HashMap};

use serde::{Deserialize, Serialize};

use crate::store::{Account, AccountType, ConnectionStatus, ExternalConnection, TaxpayerEntity, TaxpayerType};

/// Reporting scope shared by the holdings view and the tax dashboard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DashboardScope {
    Household,
    Trust,
    Personal,
}

impl DashboardScope {
    pub fn parse(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "trust" => DashboardScope::Trust,
            "personal" => DashboardScope::Personal,
            _ => DashboardScope::Household,
        }
    }

    pub fn matches(&self, entity_type: TaxpayerType) -> bool {
        match self {
            DashboardScope::Household => true,
            DashboardScope::Trust => entity_type == TaxpayerType::Trust,
            DashboardScope::Personal => entity_type == TaxpayerType::Personal,
        }
    }
}

pub fn taxpayer_ids_for_scope(scope: DashboardScope, taxpayers: &[TaxpayerEntity]) -> Vec<i64> {
    taxpayers
        .iter()
        .filter(|tp| scope.matches(tp.entity_type))
        .map(|tp| tp.id)
        .collect()
}

/// Account ids within the scope; `ira_only` narrows to IRA accounts.
pub fn account_ids_for_scope(
    scope: DashboardScope,
    taxpayers: &[TaxpayerEntity],
    accounts: &[Account],
    ira_only: bool,
) -> Vec<i64> {
    let tp_ids: BTreeSet<i64> = taxpayer_ids_for_scope(scope, taxpayers).into_iter().collect();
    accounts
        .iter()
        .filter(|a| tp_ids.contains(&a.taxpayer_id))
        .filter(|a| !ira_only || a.account_type == AccountType::Ira)
        .map(|a| a.id)
        .collect()
}

/// Select ACTIVE connections, preferring live connectors over offline
/// duplicates per taxpayer.
///
/// The same brokerage account is commonly imported by more than one connector
/// (offline files plus a web service); when both are active, downstream
/// metrics would double-count. Per taxpayer, per broker group:
///
/// * IB: only `IB_FLEX_WEB` connections when any is active, otherwise all.
/// * CHASE: only `CHASE_OFFLINE` when present; otherwise everything except
///   `CHASE_YODLEE`, which needs live credentials and is skipped by default.
/// * Any other broker: all active connections.
///
/// Pure: the same inputs always produce the same set.
pub fn preferred_connection_ids_for_taxpayers(
    taxpayer_ids: &[i64],
    connections: &[ExternalConnection],
) -> BTreeSet<i64> {
    let tp_ids: BTreeSet<i64> = taxpayer_ids.iter().copied().collect();

    let mut by_tp_broker: HashMap<(i64, String), Vec<&ExternalConnection>> = HashMap::new();
    for conn in connections {
        if conn.status != ConnectionStatus::Active || !tp_ids.contains(&conn.taxpayer_id) {
            continue;
        }
        by_tp_broker
            .entry((conn.taxpayer_id, conn.broker.to_ascii_uppercase()))
            .or_default()
            .push(conn);
    }

    let mut selected = BTreeSet::new();
    for ((_tp, broker), conns) in by_tp_broker {
        let connector_of = |c: &ExternalConnection| {
            c.connector.as_deref().unwrap_or("").to_ascii_uppercase()
        };
        match broker.as_str() {
            "IB" => {
                let web: Vec<&&ExternalConnection> = conns
                    .iter()
                    .filter(|c| connector_of(c) == "IB_FLEX_WEB")
                    .collect();
                if web.is_empty() {
                    selected.extend(conns.iter().map(|c| c.id));
                } else {
                    selected.extend(web.iter().map(|c| c.id));
                }
            }
            "CHASE" => {
                let offline: Vec<&&ExternalConnection> = conns
                    .iter()
                    .filter(|c| connector_of(c) == "CHASE_OFFLINE")
                    .collect();
                if offline.is_empty() {
                    selected.extend(
                        conns
                            .iter()
                            .filter(|c| connector_of(c) != "CHASE_YODLEE")
                            .map(|c| c.id),
                    );
                } else {
                    selected.extend(offline.iter().map(|c| c.id));
                }
            }
            _ => selected.extend(conns.iter().map(|c| c.id)),
        }
    }
    selected
}

pub fn preferred_connection_ids_for_scope(
    scope: DashboardScope,
    taxpayers: &[TaxpayerEntity],
    connections: &[ExternalConnection],
) -> BTreeSet<i64> {
    let tp_ids = taxpayer_ids_for_scope(scope, taxpayers);
    preferred_connection_ids_for_taxpayers(&tp_ids, connections)
}

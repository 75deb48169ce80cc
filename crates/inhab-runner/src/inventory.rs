use anyhow::{anyhow, Result};
use inhab_core::truncate_excerpt;
use inhab_plan::{canonical_full_type, canonicalize_address, dummy_object_id, Argument, Plan};
use reqwest::blocking::Client as HttpClient;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, warn};

pub const INVENTORY_PAGE_SIZE: usize = 50;
pub const INVENTORY_CAP: usize = 200;

/// Canonical full type string to owned object ids, in discovery order.
pub type Inventory = BTreeMap<String, Vec<String>>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OwnedObject {
    pub object_id: String,
    pub type_tag: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OwnedObjectPage {
    pub objects: Vec<OwnedObject>,
    pub next_cursor: Option<String>,
    pub has_next_page: bool,
}

pub trait OwnedObjectSource {
    fn fetch_page(&self, owner: &str, cursor: Option<&str>, limit: usize) -> Result<OwnedObjectPage>;
}

/// Owned-object listing over the node's JSON-RPC endpoint.
pub struct RpcOwnedObjectSource {
    endpoint: String,
    client: HttpClient,
}

impl RpcOwnedObjectSource {
    pub fn new(endpoint: &str, timeout: Duration) -> Result<Self> {
        let endpoint = endpoint.trim().to_string();
        if endpoint.is_empty() {
            return Err(anyhow!("rpc endpoint must not be empty"));
        }
        let client = HttpClient::builder()
            .connect_timeout(Duration::from_secs(5))
            .timeout(timeout)
            .build()?;
        Ok(Self { endpoint, client })
    }
}

impl OwnedObjectSource for RpcOwnedObjectSource {
    fn fetch_page(&self, owner: &str, cursor: Option<&str>, limit: usize) -> Result<OwnedObjectPage> {
        let body = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": "suix_getOwnedObjects",
            "params": [owner, {"filter": null, "options": {"showType": true}}, cursor, limit],
        });
        let response = self
            .client
            .post(&self.endpoint)
            .json(&body)
            .send()
            .map_err(|err| anyhow!("rpc POST {} transport error: {}", self.endpoint, err))?;
        let status = response.status();
        if !status.is_success() {
            let text = response
                .text()
                .map(|value| truncate_excerpt(&value))
                .unwrap_or_else(|_| "<response body unavailable>".to_string());
            return Err(anyhow!(
                "rpc POST {} failed: status={} body={}",
                self.endpoint,
                status.as_u16(),
                text
            ));
        }
        let value: Value = response
            .json()
            .map_err(|err| anyhow!("rpc POST {} returned invalid JSON: {}", self.endpoint, err))?;
        parse_owned_objects_response(&value)
    }
}

/// Extracts one page from a `suix_getOwnedObjects` JSON-RPC response.
pub fn parse_owned_objects_response(value: &Value) -> Result<OwnedObjectPage> {
    if let Some(error) = value.get("error") {
        return Err(anyhow!("rpc error: {}", truncate_excerpt(&error.to_string())));
    }
    let result = value
        .get("result")
        .ok_or_else(|| anyhow!("rpc response has no result"))?;
    let entries = result
        .get("data")
        .and_then(Value::as_array)
        .ok_or_else(|| anyhow!("rpc result has no data array"))?;
    let objects = entries
        .iter()
        .filter_map(|entry| entry.get("data"))
        .filter_map(|data| {
            let object_id = data.get("objectId")?.as_str()?.to_string();
            let type_tag = data.get("type").and_then(Value::as_str).map(str::to_string);
            Some(OwnedObject { object_id, type_tag })
        })
        .collect();
    Ok(OwnedObjectPage {
        objects,
        next_cursor: result
            .get("nextCursor")
            .and_then(Value::as_str)
            .map(str::to_string),
        has_next_page: result
            .get("hasNextPage")
            .and_then(Value::as_bool)
            .unwrap_or(false),
    })
}

fn is_well_formed_address(owner: &str) -> bool {
    let trimmed = owner.trim();
    let Some(hex) = trimmed.strip_prefix("0x").or_else(|| trimmed.strip_prefix("0X")) else {
        return false;
    };
    !hex.is_empty() && hex.len() <= 64 && hex.chars().all(|c| c.is_ascii_hexdigit())
}

/// Best-effort listing of `owner`'s objects keyed by canonical type.
///
/// Never fails. Transport errors, a malformed owner and a page that claims
/// more data without handing out a cursor all produce an empty inventory.
/// Reaching the object cap stops collection and keeps what was gathered.
pub fn fetch_inventory(source: &dyn OwnedObjectSource, owner: &str) -> Inventory {
    if !is_well_formed_address(owner) {
        debug!(owner, "acting party is not an address; skipping inventory");
        return Inventory::new();
    }
    let owner = canonicalize_address(owner);
    let mut inventory = Inventory::new();
    let mut collected = 0usize;
    let mut cursor: Option<String> = None;

    loop {
        let limit = INVENTORY_PAGE_SIZE.min(INVENTORY_CAP - collected);
        let page = match source.fetch_page(&owner, cursor.as_deref(), limit) {
            Ok(page) => page,
            Err(err) => {
                warn!(owner = %owner, error = %err, "inventory fetch failed; continuing without inventory");
                return Inventory::new();
            }
        };
        for object in page.objects {
            if collected >= INVENTORY_CAP {
                break;
            }
            collected += 1;
            if let Some(type_tag) = object.type_tag {
                inventory
                    .entry(canonical_full_type(&type_tag))
                    .or_default()
                    .push(object.object_id);
            }
        }
        if collected >= INVENTORY_CAP {
            debug!(owner = %owner, collected, "inventory cap reached");
            break;
        }
        if !page.has_next_page {
            break;
        }
        match page.next_cursor {
            Some(next) if cursor.as_deref() != Some(next.as_str()) => cursor = Some(next),
            _ => {
                warn!(owner = %owner, "inventory pagination truncated; continuing without inventory");
                return Inventory::new();
            }
        }
    }
    inventory
}

#[derive(Debug, Clone, PartialEq)]
pub struct PlaceholderResolution {
    pub plan: Plan,
    /// False when at least one placeholder fell back to a dummy id.
    pub complete: bool,
    pub substituted: usize,
    /// Canonical types for which no owned object was found.
    pub unresolved: Vec<String>,
}

/// Replaces each placeholder with the first owned object of its type, or a
/// deterministic dummy id when none exists. Returns a new plan.
pub fn resolve_placeholders(plan: &Plan, inventory: &Inventory) -> PlaceholderResolution {
    let mut resolved = plan.clone();
    let mut substituted = 0usize;
    let mut unresolved = Vec::new();
    for arg in resolved.calls.iter_mut().flat_map(|call| call.args.iter_mut()) {
        let Argument::Placeholder(type_tag) = arg else {
            continue;
        };
        let canonical = canonical_full_type(type_tag);
        let id = match inventory.get(&canonical).and_then(|ids| ids.first()) {
            Some(id) => {
                substituted += 1;
                id.clone()
            }
            None => {
                let dummy = dummy_object_id(type_tag);
                if !unresolved.contains(&canonical) {
                    unresolved.push(canonical);
                }
                dummy
            }
        };
        *arg = Argument::ImmOrOwnedObject(id);
    }
    PlaceholderResolution {
        plan: resolved,
        complete: unresolved.is_empty(),
        substituted,
        unresolved,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::collections::VecDeque;

    const COIN: &str = "0x2::coin::Coin<0x2::sui::SUI>";

    struct FakeSource {
        pages: RefCell<VecDeque<Result<OwnedObjectPage>>>,
        calls: RefCell<Vec<(Option<String>, usize)>>,
    }

    impl FakeSource {
        fn new(pages: Vec<Result<OwnedObjectPage>>) -> Self {
            Self {
                pages: RefCell::new(pages.into()),
                calls: RefCell::new(Vec::new()),
            }
        }
    }

    impl OwnedObjectSource for FakeSource {
        fn fetch_page(&self, _owner: &str, cursor: Option<&str>, limit: usize) -> Result<OwnedObjectPage> {
            self.calls
                .borrow_mut()
                .push((cursor.map(str::to_string), limit));
            self.pages
                .borrow_mut()
                .pop_front()
                .unwrap_or_else(|| Ok(OwnedObjectPage::default()))
        }
    }

    fn objects(prefix: &str, count: usize, type_tag: &str) -> Vec<OwnedObject> {
        (0..count)
            .map(|i| OwnedObject {
                object_id: format!("0x{}{}", prefix, i),
                type_tag: Some(type_tag.to_string()),
            })
            .collect()
    }

    fn page(objects: Vec<OwnedObject>, next: Option<&str>, more: bool) -> Result<OwnedObjectPage> {
        Ok(OwnedObjectPage {
            objects,
            next_cursor: next.map(str::to_string),
            has_next_page: more,
        })
    }

    #[test]
    fn pages_are_followed_and_keyed_by_canonical_type() {
        let source = FakeSource::new(vec![
            page(objects("a", 2, COIN), Some("c1"), true),
            page(objects("b", 1, "0x02::coin::Coin<0x2::sui::SUI>"), None, false),
        ]);
        let inventory = fetch_inventory(&source, "0xa11ce");
        let key = canonical_full_type(COIN);
        assert_eq!(inventory.len(), 1);
        assert_eq!(inventory[&key], vec!["0xa0", "0xa1", "0xb0"]);
        assert_eq!(
            *source.calls.borrow(),
            vec![(None, INVENTORY_PAGE_SIZE), (Some("c1".to_string()), INVENTORY_PAGE_SIZE)]
        );
    }

    #[test]
    fn cap_keeps_collected_objects() {
        let pages = (0..5)
            .map(|i| page(objects(&format!("p{}_", i), 50, COIN), Some(&format!("c{}", i)), true))
            .collect();
        let source = FakeSource::new(pages);
        let inventory = fetch_inventory(&source, "0xa11ce");
        assert_eq!(inventory[&canonical_full_type(COIN)].len(), INVENTORY_CAP);
        assert_eq!(source.calls.borrow().len(), 4);
    }

    #[test]
    fn truncation_and_errors_yield_empty_inventory() {
        let truncated = FakeSource::new(vec![page(objects("a", 3, COIN), None, true)]);
        assert!(fetch_inventory(&truncated, "0xa11ce").is_empty());

        let repeating = FakeSource::new(vec![
            page(objects("a", 1, COIN), Some("same"), true),
            page(objects("b", 1, COIN), Some("same"), true),
        ]);
        assert!(fetch_inventory(&repeating, "0xa11ce").is_empty());

        let failing = FakeSource::new(vec![
            page(objects("a", 1, COIN), Some("c1"), true),
            Err(anyhow!("connection reset")),
        ]);
        assert!(fetch_inventory(&failing, "0xa11ce").is_empty());
    }

    #[test]
    fn non_address_owner_makes_no_calls() {
        let source = FakeSource::new(vec![page(objects("a", 1, COIN), None, false)]);
        assert!(fetch_inventory(&source, "alice").is_empty());
        assert!(fetch_inventory(&source, "0x").is_empty());
        assert!(source.calls.borrow().is_empty());
    }

    #[test]
    fn unreachable_rpc_endpoint_is_tolerated() {
        let source = RpcOwnedObjectSource::new("http://127.0.0.1:9", Duration::from_secs(2))
            .expect("client");
        assert!(fetch_inventory(&source, "0xa11ce").is_empty());
    }

    #[test]
    fn rpc_response_parsing() {
        let page = parse_owned_objects_response(&json!({"jsonrpc": "2.0", "id": 1, "result": {
            "data": [
                {"data": {"objectId": "0x1", "type": COIN}},
                {"data": {"objectId": "0x2"}},
                {"error": {"code": "deleted"}}
            ],
            "nextCursor": "0x2",
            "hasNextPage": true
        }}))
        .expect("page");
        assert_eq!(page.objects.len(), 2);
        assert_eq!(page.objects[1].type_tag, None);
        assert_eq!(page.next_cursor.as_deref(), Some("0x2"));
        assert!(page.has_next_page);

        assert!(parse_owned_objects_response(&json!({"error": {"message": "bad owner"}})).is_err());
        assert!(parse_owned_objects_response(&json!({"result": {}})).is_err());
    }

    #[test]
    fn placeholders_resolve_to_first_candidate_or_dummy() {
        let plan = Plan::from_value(&json!({"calls": [{"target": "0x2::pay::split", "args": [
            {"$smi_placeholder": COIN},
            {"$smi_placeholder": "0x3::nft::Nft"},
            {"u64": 1}
        ]}]}))
        .expect("plan");
        let mut inventory = Inventory::new();
        inventory.insert(
            canonical_full_type(COIN),
            vec!["0xfeed".to_string(), "0xbeef".to_string()],
        );

        let resolution = resolve_placeholders(&plan, &inventory);
        assert!(!resolution.complete);
        assert_eq!(resolution.substituted, 1);
        assert_eq!(resolution.unresolved, vec![canonical_full_type("0x3::nft::Nft")]);
        let args = &resolution.plan.calls[0].args;
        assert_eq!(args[0], Argument::ImmOrOwnedObject("0xfeed".to_string()));
        assert_eq!(args[1], Argument::ImmOrOwnedObject(dummy_object_id("0x3::nft::Nft")));
        assert_eq!(resolution.plan.placeholder_count(), 0);
        assert_eq!(plan.placeholder_count(), 2, "input plan must not change");

        let none = resolve_placeholders(&plan, &Inventory::new());
        assert_eq!(none.substituted, 0);
        assert_eq!(none.unresolved.len(), 2);
    }

    #[test]
    fn plan_without_placeholders_is_complete() {
        let plan = Plan::from_value(&json!({"calls": [{"target": "0x2::m::f", "args": [{"u8": 1}]}]}))
            .expect("plan");
        let resolution = resolve_placeholders(&plan, &Inventory::new());
        assert!(resolution.complete);
        assert_eq!(resolution.plan, plan);
    }
}

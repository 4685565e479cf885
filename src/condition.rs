//! Condition evaluator (C1, §4.1).
//!
//! Pure, deterministic, side-effect-free. Resolves dotted attribute paths
//! against a nested JSON context and evaluates a [`Condition`] tree to a
//! `bool`. Every leaf-level error (bad regex, type mismatch, missing CIDR)
//! is caught and treated as `false` — this function never returns a `Result`
//! and must never raise (§4.1, §9 "tagged sum").

use std::net::IpAddr;

use chrono::{NaiveTime, Utc};
use ipnet::IpNet;
use serde_json::Value;

use crate::domain::{Condition, Leaf, Operator};

/// A resolved attribute lookup. Distinguished from `Value::Null` so that a
/// present-but-null attribute and a missing one are never confused (§9).
enum Resolved<'a> {
    Present(&'a Value),
    Absent,
}

/// Evaluate `condition` against `context`. Never panics, never errors.
#[must_use]
pub fn evaluate(condition: &Condition, context: &Value) -> bool {
    match condition {
        Condition::And(children) => children.iter().all(|c| evaluate(c, context)),
        Condition::Or(children) => children.iter().any(|c| evaluate(c, context)),
        Condition::Not(inner) => !evaluate(inner, context),
        Condition::Custom(inner) => evaluate(inner, context),
        Condition::Leaf(leaf) => evaluate_leaf(leaf, context),
    }
}

fn evaluate_leaf(leaf: &Leaf, context: &Value) -> bool {
    let rhs = match (&leaf.value, &leaf.value_from) {
        (_, Some(path)) => resolve_path(context, path),
        (Some(v), None) => Resolved::Present(v),
        (None, None) => Resolved::Absent,
    };

    // `within` checks the current wall clock against `rhs` and never
    // consults the attribute path; `leaf.attribute` is a placeholder for
    // this operator, so it must skip the LHS-presence gate below (§4.1).
    if leaf.operator == Operator::Within {
        let Resolved::Present(rhs) = rhs else { return false };
        return within_time_window(rhs);
    }

    let lhs = resolve_path(context, &leaf.attribute);

    // Every operator except `empty`/`not_empty` treats an absent LHS as a
    // guaranteed-false comparison (§4.1).
    let Resolved::Present(lhs) = lhs else {
        return matches!(leaf.operator, Operator::Empty);
    };

    apply(leaf.operator, lhs, rhs)
}

fn resolve_path<'a>(context: &'a Value, path: &str) -> Resolved<'a> {
    let mut current = context;
    for segment in path.split('.') {
        match current.get(segment) {
            Some(next) => current = next,
            None => return Resolved::Absent,
        }
    }
    Resolved::Present(current)
}

#[allow(clippy::too_many_lines)]
fn apply(op: Operator, lhs: &Value, rhs: Resolved<'_>) -> bool {
    // Operators that tolerate an absent RHS (collection-size / existence
    // checks only need the LHS).
    match op {
        Operator::Empty => return value_is_empty(lhs),
        Operator::NotEmpty => return !value_is_empty(lhs),
        _ => {}
    }

    let Resolved::Present(rhs) = rhs else { return false };

    match op {
        Operator::Eq => lhs == rhs,
        Operator::Ne => lhs != rhs,
        Operator::Lt => compare_numbers(lhs, rhs).is_some_and(std::cmp::Ordering::is_lt),
        Operator::Le => compare_numbers(lhs, rhs).is_some_and(std::cmp::Ordering::is_le),
        Operator::Gt => compare_numbers(lhs, rhs).is_some_and(std::cmp::Ordering::is_gt),
        Operator::Ge => compare_numbers(lhs, rhs).is_some_and(std::cmp::Ordering::is_ge),
        Operator::In => as_array(rhs).is_some_and(|items| items.iter().any(|v| v == lhs)),
        Operator::Contains => as_array(lhs).is_some_and(|items| items.iter().any(|v| v == rhs)),
        Operator::OneOf => as_array(rhs).is_some_and(|items| items.iter().any(|v| v == lhs)),
        Operator::ContainsAny => {
            as_array(lhs).zip(as_array(rhs)).is_some_and(|(l, r)| r.iter().any(|v| l.contains(v)))
        }
        Operator::ContainsAll => {
            as_array(lhs).zip(as_array(rhs)).is_some_and(|(l, r)| r.iter().all(|v| l.contains(v)))
        }
        Operator::Startswith => str_cmp(lhs, rhs, str::starts_with),
        Operator::Endswith => str_cmp(lhs, rhs, str::ends_with),
        Operator::Regex => regex_match(lhs, rhs),
        Operator::RegexNot => !regex_match(lhs, rhs),
        Operator::Ilike => str_cmp_ci(lhs, rhs, |l, r| l.contains(r)),
        Operator::NotIlike => !str_cmp_ci(lhs, rhs, |l, r| l.contains(r)),
        Operator::Wildcard => wildcard_match(lhs, rhs),
        Operator::LenEq => len_cmp(lhs, rhs, |l, r| l == r),
        Operator::LenLt => len_cmp(lhs, rhs, |l, r| l < r),
        Operator::LenGt => len_cmp(lhs, rhs, |l, r| l > r),
        Operator::Between => between(lhs, rhs, true),
        Operator::NotBetween => !between(lhs, rhs, true),
        Operator::IpInCidr => ip_in_cidr(lhs, rhs),
        Operator::IpNotInCidr => !ip_in_cidr(lhs, rhs),
        Operator::Before => temporal_cmp(lhs, rhs).is_some_and(std::cmp::Ordering::is_lt),
        Operator::After => temporal_cmp(lhs, rhs).is_some_and(std::cmp::Ordering::is_gt),
        Operator::Within => within_time_window(rhs),
        Operator::Empty | Operator::NotEmpty => unreachable!("handled above"),
    }
}

fn value_is_empty(v: &Value) -> bool {
    match v {
        Value::Array(items) => items.is_empty(),
        Value::Object(map) => map.is_empty(),
        Value::String(s) => s.is_empty(),
        Value::Null => true,
        _ => false,
    }
}

fn as_array(v: &Value) -> Option<&Vec<Value>> {
    v.as_array()
}

fn compare_numbers(lhs: &Value, rhs: &Value) -> Option<std::cmp::Ordering> {
    let l = lhs.as_f64()?;
    let r = rhs.as_f64()?;
    l.partial_cmp(&r)
}

fn str_cmp(lhs: &Value, rhs: &Value, f: impl Fn(&str, &str) -> bool) -> bool {
    lhs.as_str().zip(rhs.as_str()).is_some_and(|(l, r)| f(l, r))
}

fn str_cmp_ci(lhs: &Value, rhs: &Value, f: impl Fn(&str, &str) -> bool) -> bool {
    lhs.as_str().zip(rhs.as_str()).is_some_and(|(l, r)| f(&l.to_lowercase(), &r.to_lowercase()))
}

fn regex_match(lhs: &Value, rhs: &Value) -> bool {
    let Some(haystack) = lhs.as_str() else { return false };
    let Some(pattern) = rhs.as_str() else { return false };
    regex::Regex::new(pattern).is_ok_and(|re| re.is_match(haystack))
}

/// `*` matches any run of characters; the rest of the pattern is literal.
fn wildcard_match(lhs: &Value, rhs: &Value) -> bool {
    let Some(haystack) = lhs.as_str() else { return false };
    let Some(pattern) = rhs.as_str() else { return false };
    let escaped = regex::escape(pattern).replace("\\*", ".*");
    regex::Regex::new(&format!("^{escaped}$")).is_ok_and(|re| re.is_match(haystack))
}

fn len_cmp(lhs: &Value, rhs: &Value, f: impl Fn(usize, usize) -> bool) -> bool {
    let Some(expected) = rhs.as_u64() else { return false };
    let len = match lhs {
        Value::Array(items) => items.len(),
        Value::String(s) => s.chars().count(),
        Value::Object(map) => map.len(),
        _ => return false,
    };
    f(len, expected as usize)
}

/// `rhs` is `[lo, hi]`, inclusive on both ends (§4.1 "range").
fn between(lhs: &Value, rhs: &Value, inclusive: bool) -> bool {
    let Some(bounds) = rhs.as_array() else { return false };
    let [lo, hi] = bounds.as_slice() else { return false };
    let (Some(l), Some(value), Some(h)) = (lo.as_f64(), lhs.as_f64(), hi.as_f64()) else {
        return false;
    };
    if inclusive { value >= l && value <= h } else { value > l && value < h }
}

/// `rhs` is either a single CIDR string or a list of CIDR strings.
fn ip_in_cidr(lhs: &Value, rhs: &Value) -> bool {
    let Some(ip_str) = lhs.as_str() else { return false };
    let Ok(ip) = ip_str.parse::<IpAddr>() else { return false };

    let cidrs: Vec<&str> = match rhs {
        Value::String(s) => vec![s.as_str()],
        Value::Array(items) => items.iter().filter_map(Value::as_str).collect(),
        _ => return false,
    };

    cidrs.iter().any(|cidr| cidr.parse::<IpNet>().is_ok_and(|net| net.contains(&ip)))
}

/// Accepts either RFC 3339 strings or epoch-second numbers on both sides.
fn temporal_cmp(lhs: &Value, rhs: &Value) -> Option<std::cmp::Ordering> {
    let l = parse_instant(lhs)?;
    let r = parse_instant(rhs)?;
    Some(l.cmp(&r))
}

fn parse_instant(v: &Value) -> Option<chrono::DateTime<Utc>> {
    match v {
        Value::String(s) => chrono::DateTime::parse_from_rfc3339(s).ok().map(|dt| dt.with_timezone(&Utc)),
        Value::Number(n) => n.as_i64().and_then(|secs| chrono::DateTime::from_timestamp(secs, 0)),
        _ => None,
    }
}

/// `rhs` is `{"start": "HH:MM", "end": "HH:MM"}` checked against the current
/// UTC wall clock; a window where `start > end` wraps past midnight (§4.1).
fn within_time_window(rhs: &Value) -> bool {
    let Some(start) = rhs.get("start").and_then(Value::as_str).and_then(parse_hhmm) else {
        return false;
    };
    let Some(end) = rhs.get("end").and_then(Value::as_str).and_then(parse_hhmm) else { return false };
    let now = Utc::now().time();

    if start <= end { now >= start && now <= end } else { now >= start || now <= end }
}

fn parse_hhmm(s: &str) -> Option<NaiveTime> {
    let (h, m) = s.split_once(':')?;
    NaiveTime::from_hms_opt(h.parse().ok()?, m.parse().ok()?, 0)
}

// Copyright 2024 dprewarm developers
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.

//! Task planning.
//!
//! Flattens the routing configuration (groups → rules → literal and
//! wildcard domains) into a canonical, deterministically ordered list of
//! pre-warm tasks. Sorting by `(group, domain)` keeps runs reproducible
//! across replays.

use crate::resolver::normalize_domain;
use serde::Deserialize;
use std::collections::HashSet;

/// A named collection of routing rules. Groups may also carry top-level
/// domains without rules; those route into group-scoped sets.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DomainGroup {
    /// Group name; also the stem for group-scoped set names.
    pub name: String,
    /// Top-level domains for rule-less groups. Entries starting with `*.`
    /// are treated as wildcard patterns.
    #[serde(default)]
    pub domains: Vec<String>,
    /// Routing rules, each with its own destination sets.
    #[serde(default)]
    pub rules: Vec<RouteRule>,
}

/// One routing rule: literal domains plus wildcard patterns, with a
/// destination IP-set per address family.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RouteRule {
    /// Literal domains.
    #[serde(default)]
    pub domains: Vec<String>,
    /// Wildcard patterns (`*.base`); the leading `*.` is optional.
    #[serde(default)]
    pub wildcard_domains: Vec<String>,
    /// Destination IPv4 set. Empty means derive from the group and rule
    /// position.
    #[serde(default)]
    pub ipset_v4: String,
    /// Destination IPv6 set. Empty means derive.
    #[serde(default)]
    pub ipset_v6: String,
}

/// One unit of pre-warm work: resolve `domain` (expanding it first when
/// `wildcard` is set) and feed the answers into the two destination sets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrewarmTask {
    /// Owning group name.
    pub group: String,
    /// Destination IPv4 set name.
    pub set_v4: String,
    /// Destination IPv6 set name.
    pub set_v6: String,
    /// Normalized domain (wildcard prefix stripped).
    pub domain: String,
    /// Whether the domain came from a wildcard pattern.
    pub wildcard: bool,
}

/// Set names for a rule: the rule's own names when present, otherwise
/// derived from the group name and the rule's position.
pub fn rule_set_names(group: &DomainGroup, index: usize) -> (String, String) {
    let rule = &group.rules[index];
    let v4 = if rule.ipset_v4.is_empty() {
        format!("{}-r{}-v4", group.name, index)
    } else {
        rule.ipset_v4.clone()
    };
    let v6 = if rule.ipset_v6.is_empty() {
        format!("{}-r{}-v6", group.name, index)
    } else {
        rule.ipset_v6.clone()
    };
    (v4, v6)
}

/// Set names for a group's rule-less top-level domains.
pub fn group_set_names(group: &DomainGroup) -> (String, String) {
    (
        format!("{}-v4", group.name),
        format!("{}-v6", group.name),
    )
}

/// Flatten `groups` into the canonical task list.
///
/// The output is sorted by `(group, domain)` ascending and contains each
/// `(group index, domain, wildcard)` triple at most once. A base that
/// appears both as a literal and as a wildcard pattern in the same rule
/// yields two tasks.
pub fn plan_tasks(groups: &[DomainGroup]) -> Vec<PrewarmTask> {
    let mut tasks = Vec::new();
    let mut seen: HashSet<(usize, String, bool)> = HashSet::new();

    let mut push = |tasks: &mut Vec<PrewarmTask>,
                    group_index: usize,
                    group: &str,
                    sets: &(String, String),
                    raw: &str,
                    wildcard: bool| {
        let domain = normalize_domain(raw);
        if domain.is_empty() {
            return;
        }
        if !seen.insert((group_index, domain.clone(), wildcard)) {
            return;
        }
        tasks.push(PrewarmTask {
            group: group.to_string(),
            set_v4: sets.0.clone(),
            set_v6: sets.1.clone(),
            domain,
            wildcard,
        });
    };

    for (group_index, group) in groups.iter().enumerate() {
        for rule_index in 0..group.rules.len() {
            let sets = rule_set_names(group, rule_index);
            let rule = &group.rules[rule_index];
            for raw in &rule.domains {
                push(&mut tasks, group_index, &group.name, &sets, raw, false);
            }
            for raw in &rule.wildcard_domains {
                push(&mut tasks, group_index, &group.name, &sets, raw, true);
            }
        }
        if group.rules.is_empty() {
            let sets = group_set_names(group);
            for raw in &group.domains {
                let wildcard = raw.trim().starts_with("*.");
                push(&mut tasks, group_index, &group.name, &sets, raw, wildcard);
            }
        }
    }

    tasks.sort_by(|a, b| (&a.group, &a.domain).cmp(&(&b.group, &b.domain)));
    tasks
}

#![forbid(unsafe_code)]

use std::collections::BTreeSet;

use formvault_contracts::access::{AccessRule, AuthContext, UserId};

/// Tag-based row visibility. Stateless: the caller passes the rule resolved from
/// whatever permission matrix snapshot it holds.
#[derive(Debug, Default, Clone, Copy)]
pub struct AccessFilter;

impl AccessFilter {
    /// All rows when the rule reads everything, all rows when the form's tags meet
    /// the rule's allow-list, otherwise none.
    pub fn filter<T>(rule: &AccessRule, rows: Vec<T>, form_tags: &BTreeSet<String>) -> Vec<T> {
        if Self::can_read(rule, form_tags) {
            rows
        } else {
            Vec::new()
        }
    }

    pub fn can_read(rule: &AccessRule, form_tags: &BTreeSet<String>) -> bool {
        rule.can_read_all || rule.tags_intersect(form_tags)
    }

    pub fn can_edit(rule: &AccessRule, form_tags: &BTreeSet<String>) -> bool {
        rule.can_edit_all || rule.tags_intersect(form_tags)
    }

    /// Tag predicate, widened by the ownership grant: `can_delete_own` lets the
    /// caller delete rows they submitted.
    pub fn can_delete(
        rule: &AccessRule,
        form_tags: &BTreeSet<String>,
        ctx: &AuthContext,
        owner: &UserId,
    ) -> bool {
        rule.can_delete_all
            || rule.tags_intersect(form_tags)
            || (rule.can_delete_own && &ctx.user_id == owner)
    }
}

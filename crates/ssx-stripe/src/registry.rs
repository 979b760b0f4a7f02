//! Object-kind registry.
//!
//! One structure drives the upserter (destination table, soft-delete
//! capability, related references), the list fetcher (list path,
//! created-filter capability, page size) and the run registry (the default
//! backfill set). Kinds are identified by the provider's `object`
//! discriminator field.

/// A provider entity type mirrored into its own table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ObjectKind {
    Customer,
    Product,
    Price,
    Plan,
    Coupon,
    Subscription,
    SubscriptionItem,
    Invoice,
    Charge,
    PaymentIntent,
    SetupIntent,
    PaymentMethod,
    Refund,
    Dispute,
    CreditNote,
    EarlyFraudWarning,
    TaxId,
}

/// Default page size for list requests.
pub const DEFAULT_PAGE_SIZE: i64 = 100;

impl ObjectKind {
    /// Every kind, in table order.
    pub fn all() -> &'static [ObjectKind] {
        use ObjectKind::*;
        &[
            Customer,
            Product,
            Price,
            Plan,
            Coupon,
            Subscription,
            SubscriptionItem,
            Invoice,
            Charge,
            PaymentIntent,
            SetupIntent,
            PaymentMethod,
            Refund,
            Dispute,
            CreditNote,
            EarlyFraudWarning,
            TaxId,
        ]
    }

    /// The kinds enumerated by a full backfill: everything that can be
    /// listed without a parent-object context parameter.
    pub fn backfill_set() -> Vec<ObjectKind> {
        Self::all()
            .iter()
            .copied()
            .filter(|k| !k.requires_context())
            .collect()
    }

    /// The provider's `object` discriminator value.
    pub fn as_str(&self) -> &'static str {
        use ObjectKind::*;
        match self {
            Customer => "customer",
            Product => "product",
            Price => "price",
            Plan => "plan",
            Coupon => "coupon",
            Subscription => "subscription",
            SubscriptionItem => "subscription_item",
            Invoice => "invoice",
            Charge => "charge",
            PaymentIntent => "payment_intent",
            SetupIntent => "setup_intent",
            PaymentMethod => "payment_method",
            Refund => "refund",
            Dispute => "dispute",
            CreditNote => "credit_note",
            EarlyFraudWarning => "radar.early_fraud_warning",
            TaxId => "tax_id",
        }
    }

    /// Parse an `object` discriminator (or CLI argument) into a kind.
    ///
    /// Accepts both the discriminator (`"radar.early_fraud_warning"`) and
    /// the table-ish CLI spelling (`"early_fraud_warning"`).
    pub fn parse(s: &str) -> Option<ObjectKind> {
        use ObjectKind::*;
        match s {
            "customer" => Some(Customer),
            "product" => Some(Product),
            "price" => Some(Price),
            "plan" => Some(Plan),
            "coupon" => Some(Coupon),
            "subscription" => Some(Subscription),
            "subscription_item" => Some(SubscriptionItem),
            "invoice" => Some(Invoice),
            "charge" => Some(Charge),
            "payment_intent" => Some(PaymentIntent),
            "setup_intent" => Some(SetupIntent),
            "payment_method" => Some(PaymentMethod),
            "refund" => Some(Refund),
            "dispute" => Some(Dispute),
            "credit_note" => Some(CreditNote),
            "radar.early_fraud_warning" | "early_fraud_warning" => Some(EarlyFraudWarning),
            "tax_id" => Some(TaxId),
            _ => None,
        }
    }

    /// Destination table name (unqualified; the gateway prepends the schema).
    pub fn table_name(&self) -> &'static str {
        use ObjectKind::*;
        match self {
            Customer => "customers",
            Product => "products",
            Price => "prices",
            Plan => "plans",
            Coupon => "coupons",
            Subscription => "subscriptions",
            SubscriptionItem => "subscription_items",
            Invoice => "invoices",
            Charge => "charges",
            PaymentIntent => "payment_intents",
            SetupIntent => "setup_intents",
            PaymentMethod => "payment_methods",
            Refund => "refunds",
            Dispute => "disputes",
            CreditNote => "credit_notes",
            EarlyFraudWarning => "early_fraud_warnings",
            TaxId => "tax_ids",
        }
    }

    /// Provider list endpoint path (relative to the API base).
    pub fn list_path(&self) -> &'static str {
        use ObjectKind::*;
        match self {
            Customer => "/v1/customers",
            Product => "/v1/products",
            Price => "/v1/prices",
            Plan => "/v1/plans",
            Coupon => "/v1/coupons",
            Subscription => "/v1/subscriptions",
            SubscriptionItem => "/v1/subscription_items",
            Invoice => "/v1/invoices",
            Charge => "/v1/charges",
            PaymentIntent => "/v1/payment_intents",
            SetupIntent => "/v1/setup_intents",
            PaymentMethod => "/v1/payment_methods",
            Refund => "/v1/refunds",
            Dispute => "/v1/disputes",
            CreditNote => "/v1/credit_notes",
            EarlyFraudWarning => "/v1/radar/early_fraud_warnings",
            TaxId => "/v1/tax_ids",
        }
    }

    /// Provider retrieve endpoint path for one object.
    pub fn retrieve_path(&self, id: &str) -> String {
        format!("{}/{}", self.list_path(), id)
    }

    /// Whether the list endpoint accepts a `created` range filter.
    ///
    /// Every routinely-backfilled kind must answer true here: a kind without
    /// the filter and with a monotonically growing list would re-fetch the
    /// same first page forever. Context-scoped kinds are exempt because they
    /// are never enumerated standalone.
    pub fn supports_created_filter(&self) -> bool {
        !self.requires_context()
    }

    /// Whether listing requires a parent-object context parameter, which
    /// excludes the kind from routine backfill (it is reached through the
    /// related-entity hook instead).
    pub fn requires_context(&self) -> bool {
        matches!(
            self,
            ObjectKind::PaymentMethod | ObjectKind::TaxId | ObjectKind::SubscriptionItem
        )
    }

    /// Whether the provider emits `*.deleted` events for this kind; rows are
    /// then flagged, never removed.
    pub fn soft_deletable(&self) -> bool {
        use ObjectKind::*;
        matches!(
            self,
            Customer | Product | Price | Plan | Coupon | Subscription | Invoice | TaxId
        )
    }

    /// Fields of this kind's document that reference other mirrored kinds.
    ///
    /// Consumed by the related-entity backfill hook: each `(field, kind)`
    /// pair names a document field whose string value (or expanded `id`) is
    /// the id of a row of `kind` that must exist for joins to resolve.
    pub fn related_refs(&self) -> &'static [(&'static str, ObjectKind)] {
        use ObjectKind::*;
        match self {
            Charge => &[
                ("customer", Customer),
                ("invoice", Invoice),
                ("payment_intent", PaymentIntent),
            ],
            Invoice => &[
                ("customer", Customer),
                ("subscription", Subscription),
                ("charge", Charge),
            ],
            Subscription => &[("customer", Customer)],
            PaymentIntent => &[("customer", Customer)],
            SetupIntent => &[("customer", Customer)],
            Price => &[("product", Product)],
            Plan => &[("product", Product)],
            Refund => &[("charge", Charge), ("payment_intent", PaymentIntent)],
            Dispute => &[("charge", Charge), ("payment_intent", PaymentIntent)],
            CreditNote => &[("customer", Customer), ("invoice", Invoice)],
            PaymentMethod => &[("customer", Customer)],
            TaxId => &[("customer", Customer)],
            EarlyFraudWarning => &[("charge", Charge)],
            Customer | Product | Coupon | SubscriptionItem => &[],
        }
    }
}

impl std::fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_round_trips_every_kind() {
        for kind in ObjectKind::all() {
            assert_eq!(ObjectKind::parse(kind.as_str()), Some(*kind));
        }
        assert_eq!(ObjectKind::parse("not_a_kind"), None);
    }

    #[test]
    fn cli_spelling_for_early_fraud_warning() {
        assert_eq!(
            ObjectKind::parse("early_fraud_warning"),
            Some(ObjectKind::EarlyFraudWarning)
        );
    }

    /// Every routinely-backfilled kind must support the created filter.
    /// A kind that omits it and has a monotonically growing list would
    /// re-fetch the same first page forever.
    #[test]
    fn backfilled_kinds_support_created_filter() {
        for kind in ObjectKind::backfill_set() {
            assert!(
                kind.supports_created_filter(),
                "{kind} is backfilled but lacks the created filter"
            );
        }
    }

    #[test]
    fn context_kinds_are_excluded_from_backfill() {
        let set = ObjectKind::backfill_set();
        assert!(!set.contains(&ObjectKind::PaymentMethod));
        assert!(!set.contains(&ObjectKind::TaxId));
        assert!(!set.contains(&ObjectKind::SubscriptionItem));
        assert_eq!(set.len(), ObjectKind::all().len() - 3);
    }

    #[test]
    fn related_refs_point_at_other_kinds() {
        for kind in ObjectKind::all() {
            for (field, target) in kind.related_refs() {
                assert_ne!(kind, target, "{kind}.{field} references itself");
            }
        }
    }

    #[test]
    fn table_names_are_unique() {
        let mut names: Vec<_> = ObjectKind::all().iter().map(|k| k.table_name()).collect();
        names.sort();
        names.dedup();
        assert_eq!(names.len(), ObjectKind::all().len());
    }
}

//! Message templates.
//!
//! The template catalogue is a closed enum: each variant carries its
//! provider template name, language code, and the input columns it consumes,
//! so a submission with missing columns is rejected before any job is
//! created rather than failing row by row at render time.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::address::canonical_address;
use crate::error::TemplateError;
use crate::source::Row;

/// Fixed payment link substituted into dues/arrears templates.
pub const PAYMENT_LINK: &str = "https://smsquare.co.in/pay2";

/// Where one `{{n}}` body parameter comes from.
#[derive(Debug, Clone, Copy)]
enum ParamSource {
    /// Verbatim row column.
    Column(&'static str),
    /// Row column reformatted as DD-MM-YYYY.
    DateColumn(&'static str),
    /// The fixed payment link.
    PaymentLink,
    /// A fixed literal.
    Literal(&'static str),
}

/// Closed set of dispatchable templates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TemplateKind {
    EmiReminder,
    TenureReminder,
    CibilNotice,
    RegistrationSlot,
    NachBouncePayment,
    NachBalance,
    RegistrationReminder,
    Welcome,
    NocDispatch,
}

impl TemplateKind {
    /// Provider-side template name.
    pub fn provider_name(self) -> &'static str {
        match self {
            TemplateKind::EmiReminder => "emi_reminder",
            TemplateKind::TenureReminder => "emi_tenure_reminder",
            TemplateKind::CibilNotice => "cibil",
            TemplateKind::RegistrationSlot => "vehicle_registration_slot",
            TemplateKind::NachBouncePayment => "nach_bounce_payment_reminder",
            TemplateKind::NachBalance => "nach_balance_reminder",
            TemplateKind::RegistrationReminder => "vehicle_registration_reminder",
            TemplateKind::Welcome => "welcome_message",
            TemplateKind::NocDispatch => "noc_dispatch",
        }
    }

    /// Stable storage/selector key (the snake_case variant name).
    pub fn key(self) -> &'static str {
        match self {
            TemplateKind::EmiReminder => "emi_reminder",
            TemplateKind::TenureReminder => "tenure_reminder",
            TemplateKind::CibilNotice => "cibil_notice",
            TemplateKind::RegistrationSlot => "registration_slot",
            TemplateKind::NachBouncePayment => "nach_bounce_payment",
            TemplateKind::NachBalance => "nach_balance",
            TemplateKind::RegistrationReminder => "registration_reminder",
            TemplateKind::Welcome => "welcome",
            TemplateKind::NocDispatch => "noc_dispatch",
        }
    }

    /// Provider language code.
    pub fn language(self) -> &'static str {
        match self {
            TemplateKind::TenureReminder | TemplateKind::RegistrationSlot => "te",
            _ => "en",
        }
    }

    fn params(self) -> &'static [ParamSource] {
        use ParamSource::*;
        match self {
            TemplateKind::EmiReminder => &[
                Column("customer_name"),
                Column("total_dues"),
                Column("loan_number"),
                DateColumn("installment_date"),
                PaymentLink,
            ],
            TemplateKind::TenureReminder => &[Column("CustomerName"), Column("VehicleNo")],
            TemplateKind::CibilNotice => &[Column("customer_name")],
            TemplateKind::RegistrationSlot => {
                &[Column("CustomerName"), DateColumn("registration_date")]
            }
            TemplateKind::NachBouncePayment => &[
                Column("customer_name"),
                Column("due_amount"),
                DateColumn("due_date"),
                Column("loan_number"),
                PaymentLink,
            ],
            TemplateKind::NachBalance => &[
                Column("customer_name"),
                Column("balance_amount"),
                Column("loan_number"),
                Column("urm_number"),
                DateColumn("due_date"),
                Column("bank_account_number"),
            ],
            TemplateKind::RegistrationReminder => &[
                Column("CustomerName"),
                Column("Vehicle_No"),
                Column("Loan_number"),
            ],
            TemplateKind::Welcome => &[Column("customer_name")],
            TemplateKind::NocDispatch => &[
                Column("Customer Name"),
                Column("Agreement No"),
                Column("Vehicle No"),
                Column("Courier Status"),
                Column("PODS"),
                DateColumn("Courier Date"),
                Literal("7"),
            ],
        }
    }

    /// Row columns this template reads, for submission-time validation.
    pub fn required_columns(self) -> Vec<&'static str> {
        self.params()
            .iter()
            .filter_map(|p| match p {
                ParamSource::Column(c) | ParamSource::DateColumn(c) => Some(*c),
                _ => None,
            })
            .collect()
    }

    /// Check a row source header for every required column.
    pub fn validate_header(self, header: &[String]) -> Result<(), TemplateError> {
        for column in self.required_columns() {
            if !header.iter().any(|h| h == column) {
                return Err(TemplateError::MissingColumn {
                    template: self.provider_name().to_string(),
                    column: column.to_string(),
                });
            }
        }
        Ok(())
    }

    /// Resolve the ordered `{{n}}` parameter values for one row.
    pub fn parameter_values(self, row: &Row) -> Vec<String> {
        self.params()
            .iter()
            .map(|p| match p {
                ParamSource::Column(c) => row.get(*c).cloned().unwrap_or_default(),
                ParamSource::DateColumn(c) => {
                    format_template_date(row.get(*c).map(String::as_str).unwrap_or(""))
                }
                ParamSource::PaymentLink => PAYMENT_LINK.to_string(),
                ParamSource::Literal(v) => (*v).to_string(),
            })
            .collect()
    }
}

impl std::str::FromStr for TemplateKind {
    type Err = TemplateError;

    /// Accepts the snake_case variant name or the legacy numeric code.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "1" | "emi_reminder" => Ok(TemplateKind::EmiReminder),
            "2" | "tenure_reminder" => Ok(TemplateKind::TenureReminder),
            "3" | "cibil_notice" => Ok(TemplateKind::CibilNotice),
            "4" | "registration_slot" => Ok(TemplateKind::RegistrationSlot),
            "5" | "nach_bounce_payment" => Ok(TemplateKind::NachBouncePayment),
            "6" | "nach_balance" => Ok(TemplateKind::NachBalance),
            "7" | "registration_reminder" => Ok(TemplateKind::RegistrationReminder),
            "8" | "welcome" => Ok(TemplateKind::Welcome),
            "9" | "noc_dispatch" => Ok(TemplateKind::NocDispatch),
            other => Err(TemplateError::UnknownChoice(other.to_string())),
        }
    }
}

impl std::fmt::Display for TemplateKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.provider_name())
    }
}

// ── Rendering ───────────────────────────────────────────────────────────

/// A rendered template ready for dispatch: the provider payload plus the
/// human-readable preview logged alongside the send.
#[derive(Debug, Clone)]
pub struct RenderedMessage {
    pub payload: serde_json::Value,
    pub preview: String,
}

/// Build the provider payload and preview text for one row.
///
/// `body` is the template body fetched from the provider (placeholders
/// `{{1}}`, `{{2}}`, ...).
pub fn render(
    template: TemplateKind,
    body: &str,
    row: &Row,
    to: &str,
) -> Result<RenderedMessage, TemplateError> {
    if body.is_empty() {
        return Err(TemplateError::BodyUnavailable(
            template.provider_name().to_string(),
        ));
    }

    let values = template.parameter_values(row);

    let mut preview = body.to_string();
    for (i, value) in values.iter().enumerate() {
        preview = preview.replace(&format!("{{{{{}}}}}", i + 1), value);
    }

    let parameters: Vec<serde_json::Value> = values
        .iter()
        .map(|v| serde_json::json!({"type": "text", "text": v}))
        .collect();

    let payload = serde_json::json!({
        "messaging_product": "whatsapp",
        "to": canonical_address(to),
        "type": "template",
        "template": {
            "name": template.provider_name(),
            "language": {"code": template.language()},
            "components": [{"type": "body", "parameters": parameters}],
        },
    });

    Ok(RenderedMessage { payload, preview })
}

/// Extract the counterpart address column from a row.
pub fn row_address(row: &Row) -> String {
    row.get("cust_mobile")
        .or_else(|| row.get("CustMobile"))
        .cloned()
        .unwrap_or_default()
}

/// Extract the customer display name from a row.
pub fn row_customer_name(row: &Row) -> String {
    row.get("customer_name")
        .or_else(|| row.get("CustomerName"))
        .or_else(|| row.get("Customer Name"))
        .cloned()
        .unwrap_or_default()
}

/// Reformat an ISO-like date string as DD-MM-YYYY; unparseable input is
/// passed through unchanged.
pub fn format_template_date(value: &str) -> String {
    let s = value.trim();
    if s.is_empty() {
        return String::new();
    }
    for fmt in ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S"] {
        if let Ok(dt) = chrono::NaiveDateTime::parse_from_str(s, fmt) {
            return dt.format("%d-%m-%Y").to_string();
        }
    }
    for fmt in ["%Y-%m-%d", "%d-%m-%Y"] {
        if let Ok(d) = NaiveDate::parse_from_str(s, fmt) {
            return d.format("%d-%m-%Y").to_string();
        }
    }
    s.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn row(pairs: &[(&str, &str)]) -> Row {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect::<HashMap<_, _>>()
    }

    #[test]
    fn parse_numeric_and_named_choices() {
        assert_eq!("1".parse::<TemplateKind>().unwrap(), TemplateKind::EmiReminder);
        assert_eq!(
            "emi_reminder".parse::<TemplateKind>().unwrap(),
            TemplateKind::EmiReminder
        );
        assert_eq!("8".parse::<TemplateKind>().unwrap(), TemplateKind::Welcome);
        assert!("0".parse::<TemplateKind>().is_err());
        assert!("bogus".parse::<TemplateKind>().is_err());
    }

    #[test]
    fn header_validation_catches_missing_column() {
        let header: Vec<String> = ["customer_name", "cust_mobile"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        assert!(TemplateKind::Welcome.validate_header(&header).is_ok());

        let err = TemplateKind::EmiReminder.validate_header(&header).unwrap_err();
        match err {
            TemplateError::MissingColumn { column, .. } => assert_eq!(column, "total_dues"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn render_substitutes_placeholders_in_order() {
        let r = row(&[("customer_name", "Ravi"), ("cust_mobile", "9491006569")]);
        let rendered = render(
            TemplateKind::Welcome,
            "Welcome {{1}}, glad to have you.",
            &r,
            "9491006569",
        )
        .unwrap();
        assert_eq!(rendered.preview, "Welcome Ravi, glad to have you.");
        assert_eq!(rendered.payload["to"], "+919491006569");
        assert_eq!(rendered.payload["template"]["name"], "welcome_message");
        assert_eq!(rendered.payload["template"]["language"]["code"], "en");
    }

    #[test]
    fn render_fails_without_body() {
        let r = row(&[("customer_name", "Ravi")]);
        let err = render(TemplateKind::Welcome, "", &r, "9491006569").unwrap_err();
        assert!(matches!(err, TemplateError::BodyUnavailable(_)));
    }

    #[test]
    fn emi_reminder_carries_payment_link() {
        let r = row(&[
            ("customer_name", "Ravi"),
            ("total_dues", "12000"),
            ("loan_number", "LN42"),
            ("installment_date", "2026-03-15"),
        ]);
        let values = TemplateKind::EmiReminder.parameter_values(&r);
        assert_eq!(values[0], "Ravi");
        assert_eq!(values[3], "15-03-2026");
        assert_eq!(values[4], PAYMENT_LINK);
    }

    #[test]
    fn noc_dispatch_literal_parameter() {
        let r = row(&[
            ("Customer Name", "Ravi"),
            ("Agreement No", "AG1"),
            ("Vehicle No", "TS09"),
            ("Courier Status", "Shipped"),
            ("PODS", "P1"),
            ("Courier Date", "2026-01-05"),
        ]);
        let values = TemplateKind::NocDispatch.parameter_values(&r);
        assert_eq!(values.len(), 7);
        assert_eq!(values[6], "7");
    }

    #[test]
    fn date_formats() {
        assert_eq!(format_template_date("2026-03-15"), "15-03-2026");
        assert_eq!(format_template_date("2026-03-15 10:30:00"), "15-03-2026");
        assert_eq!(format_template_date("2026-03-15T10:30:00"), "15-03-2026");
        assert_eq!(format_template_date("15-03-2026"), "15-03-2026");
        assert_eq!(format_template_date("not a date"), "not a date");
        assert_eq!(format_template_date(""), "");
    }

    #[test]
    fn telugu_templates() {
        assert_eq!(TemplateKind::TenureReminder.language(), "te");
        assert_eq!(TemplateKind::RegistrationSlot.language(), "te");
        assert_eq!(TemplateKind::EmiReminder.language(), "en");
    }

    #[test]
    fn row_address_fallback() {
        let r = row(&[("CustMobile", "9491006569")]);
        assert_eq!(row_address(&r), "9491006569");
        let r2 = row(&[("cust_mobile", "111"), ("CustMobile", "222")]);
        assert_eq!(row_address(&r2), "111");
    }
}

//! Statement builders for the relational export
//!
//! Both statements read the same view with the same filter, so the count
//! returned by one can validate the file written by the other. `COPY`
//! cannot take bind parameters; the filter is rendered from typed values
//! only, and the view name is checked by [`is_valid_view_name`] before use.

use chrono::NaiveDate;

/// Columns of the export view, in export order
pub const VIEW_COLUMNS: [&str; 80] = [
    "transaction_id",
    "detached_award_proc_unique",
    "afa_generated_unique",
    "generated_unique_transaction_id",
    "display_award_id",
    "update_date",
    "modification_number",
    "generated_unique_award_id",
    "award_id",
    "piid",
    "fain",
    "uri",
    "award_description",
    "product_or_service_code",
    "product_or_service_description",
    "naics_code",
    "naics_description",
    "type_description",
    "award_category",
    "recipient_unique_id",
    "parent_recipient_unique_id",
    "recipient_hash",
    "recipient_name",
    "action_date",
    "fiscal_action_date",
    "period_of_performance_start_date",
    "period_of_performance_current_end_date",
    "ordering_period_end_date",
    "transaction_fiscal_year",
    "award_fiscal_year",
    "award_amount",
    "transaction_amount",
    "face_value_loan_guarantee",
    "original_loan_subsidy_cost",
    "generated_pragmatic_obligation",
    "awarding_agency_id",
    "funding_agency_id",
    "awarding_toptier_agency_id",
    "funding_toptier_agency_id",
    "awarding_subtier_agency_id",
    "funding_subtier_agency_id",
    "awarding_toptier_agency_name",
    "funding_toptier_agency_name",
    "awarding_subtier_agency_name",
    "funding_subtier_agency_name",
    "awarding_toptier_agency_abbreviation",
    "funding_toptier_agency_abbreviation",
    "awarding_subtier_agency_abbreviation",
    "funding_subtier_agency_abbreviation",
    "awarding_toptier_agency_code",
    "funding_toptier_agency_code",
    "awarding_subtier_agency_code",
    "funding_subtier_agency_code",
    "cfda_id",
    "cfda_number",
    "cfda_title",
    "cfda_popular_name",
    "type_of_contract_pricing",
    "type_set_aside",
    "extent_competed",
    "type",
    "pop_country_code",
    "pop_country_name",
    "pop_state_code",
    "pop_county_code",
    "pop_county_name",
    "pop_zip5",
    "pop_congressional_code",
    "pop_city_name",
    "recipient_location_country_code",
    "recipient_location_country_name",
    "recipient_location_state_code",
    "recipient_location_county_code",
    "recipient_location_county_name",
    "recipient_location_zip5",
    "recipient_location_congressional_code",
    "recipient_location_city_name",
    "treasury_accounts",
    "federal_accounts",
    "business_categories",
];

/// Column every document is identified and deleted by
pub const TRANSACTION_ID_COLUMN: &str = "generated_unique_transaction_id";

/// Rows selected for one job
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExportFilter {
    pub fiscal_year: i32,
    /// Only rows with `update_date` on or after this date
    pub updated_since: Option<NaiveDate>,
}

impl ExportFilter {
    pub fn new(fiscal_year: i32, updated_since: Option<NaiveDate>) -> Self {
        Self {
            fiscal_year,
            updated_since,
        }
    }

    fn where_clause(&self) -> String {
        let mut clause = format!("transaction_fiscal_year={}", self.fiscal_year);
        if let Some(date) = self.updated_since {
            clause.push_str(&format!(" AND update_date >= '{}'", date.format("%Y-%m-%d")));
        }
        clause
    }
}

/// `SELECT COUNT(*)` over the rows an export would write
pub fn count_statement(view: &str, filter: &ExportFilter) -> String {
    format!(
        "SELECT COUNT(*) AS count FROM {} WHERE {}",
        view,
        filter.where_clause()
    )
}

/// `COPY ... TO STDOUT` producing a comma delimited file with a header row
pub fn export_statement(view: &str, filter: &ExportFilter) -> String {
    format!(
        "COPY (SELECT * FROM {} WHERE {}) TO STDOUT WITH (FORMAT csv, HEADER true, DELIMITER ',')",
        view,
        filter.where_clause()
    )
}

/// Plain or schema-qualified identifier made of ASCII letters, digits and underscores
pub fn is_valid_view_name(view: &str) -> bool {
    !view.is_empty()
        && view.split('.').count() <= 2
        && view.split('.').all(|part| {
            part.chars()
                .next()
                .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
                && part.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
        })
}

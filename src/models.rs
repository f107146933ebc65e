use bigdecimal::{BigDecimal, ToPrimitive, Zero};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::{AppError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    Admin,
    Student,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Admin => "Admin",
            Role::Student => "Student",
        }
    }
}

impl FromStr for Role {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "admin" => Ok(Role::Admin),
            "student" => Ok(Role::Student),
            other => Err(AppError::Internal(format!("Unknown role stored: {}", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FeeRequestStatus {
    Pending,
    Paid,
}

impl FeeRequestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            FeeRequestStatus::Pending => "Pending",
            FeeRequestStatus::Paid => "Paid",
        }
    }
}

impl FromStr for FeeRequestStatus {
    type Err = AppError;

    // Older rows were written as "paid"; the casing carries no meaning.
    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pending" => Ok(FeeRequestStatus::Pending),
            "paid" => Ok(FeeRequestStatus::Paid),
            other => Err(AppError::Internal(format!("Unknown fee request status: {}", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum PaymentMode {
    Cash,
    Online,
    Upi,
    Card,
    Bank,
}

impl PaymentMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentMode::Cash => "Cash",
            PaymentMode::Online => "Online",
            PaymentMode::Upi => "UPI",
            PaymentMode::Card => "Card",
            PaymentMode::Bank => "Bank",
        }
    }
}

impl fmt::Display for PaymentMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PaymentMode {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "cash" => Ok(PaymentMode::Cash),
            "online" => Ok(PaymentMode::Online),
            "upi" => Ok(PaymentMode::Upi),
            "card" => Ok(PaymentMode::Card),
            "bank" | "bank transfer" => Ok(PaymentMode::Bank),
            other => Err(AppError::Validation(format!(
                "Unknown payment mode '{}'; expected Cash, Online, UPI, Card or Bank",
                other
            ))),
        }
    }
}

impl TryFrom<String> for PaymentMode {
    type Error = AppError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<PaymentMode> for String {
    fn from(mode: PaymentMode) -> Self {
        mode.as_str().to_string()
    }
}

/// Self-reported proof attached to a bank transfer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentProof {
    pub student_bank_name: Option<String>,
    pub account_number: Option<String>,
    pub transaction_id: Option<String>,
}

impl PaymentProof {
    /// Trims every field and drops the ones left empty. Returns `None` when
    /// nothing remains.
    pub fn normalized(self) -> Option<Self> {
        fn clean(v: Option<String>) -> Option<String> {
            v.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
        }
        let proof = PaymentProof {
            student_bank_name: clean(self.student_bank_name),
            account_number: clean(self.account_number),
            transaction_id: clean(self.transaction_id),
        };
        if proof == PaymentProof::default() {
            None
        } else {
            Some(proof)
        }
    }
}

/// JSON money: serialized as a plain number, accepted as number or numeric string.
pub mod money {
    use super::*;
    use serde::{de::Error as _, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &BigDecimal, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        if value.with_scale(0) == *value {
            if let Some(whole) = value.to_i64() {
                return serializer.serialize_i64(whole);
            }
        }
        match value.to_f64() {
            Some(f) => serializer.serialize_f64(f),
            None => serializer.collect_str(value),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<BigDecimal, D::Error> {
        let raw = serde_json::Value::deserialize(deserializer)?;
        parse_value(&raw).map_err(D::Error::custom)
    }

    pub fn deserialize_option<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> std::result::Result<Option<BigDecimal>, D::Error> {
        let raw = Option::<serde_json::Value>::deserialize(deserializer)?;
        match raw {
            None | Some(serde_json::Value::Null) => Ok(None),
            Some(serde_json::Value::String(s)) if s.trim().is_empty() => Ok(None),
            Some(v) => parse_value(&v).map(Some).map_err(D::Error::custom),
        }
    }

    fn parse_value(raw: &serde_json::Value) -> std::result::Result<BigDecimal, String> {
        let text = match raw {
            serde_json::Value::Number(n) => n.to_string(),
            serde_json::Value::String(s) => s.trim().to_string(),
            other => return Err(format!("expected an amount, found {}", other)),
        };
        BigDecimal::from_str(&text).map_err(|_| format!("'{}' is not a valid amount", text))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StudentKey {
    pub roll_no: String,
    pub class_name: String,
    pub session: String,
}

/// Editable part of a student record, already trimmed and validated.
#[derive(Debug, Clone, PartialEq)]
pub struct StudentFields {
    pub name: String,
    pub roll_no: String,
    pub class_name: String,
    pub session: String,
    pub parent_name: String,
    pub contact: String,
    pub total_fees: BigDecimal,
}

impl StudentFields {
    pub fn key(&self) -> StudentKey {
        StudentKey {
            roll_no: self.roll_no.clone(),
            class_name: self.class_name.clone(),
            session: self.session.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Student {
    #[serde(rename = "_id")]
    pub id: Uuid,
    pub name: String,
    pub roll_no: String,
    #[serde(rename = "class")]
    pub class_name: String,
    pub session: String,
    pub parent_name: String,
    pub contact: String,
    #[serde(with = "money")]
    pub total_fees: BigDecimal,
    #[serde(with = "money")]
    pub paid_fees: BigDecimal,
    pub is_request_sent: bool,
    /// Fee requests whose amount is already in `paid_fees`.
    #[serde(skip)]
    pub credited_requests: HashSet<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Student {
    pub fn new(fields: StudentFields) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            name: fields.name,
            roll_no: fields.roll_no,
            class_name: fields.class_name,
            session: fields.session,
            parent_name: fields.parent_name,
            contact: fields.contact,
            total_fees: fields.total_fees,
            paid_fees: BigDecimal::zero(),
            is_request_sent: false,
            credited_requests: HashSet::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn key(&self) -> StudentKey {
        StudentKey {
            roll_no: self.roll_no.clone(),
            class_name: self.class_name.clone(),
            session: self.session.clone(),
        }
    }

    pub fn balance_due(&self) -> BigDecimal {
        &self.total_fees - &self.paid_fees
    }

    /// Overwrites the editable fields, keeping balance and request state.
    pub fn apply_fields(&mut self, fields: StudentFields) -> Result<()> {
        if fields.total_fees < self.paid_fees {
            return Err(AppError::Validation(format!(
                "Total fees cannot be lower than the {} already paid",
                self.paid_fees
            )));
        }
        self.name = fields.name;
        self.roll_no = fields.roll_no;
        self.class_name = fields.class_name;
        self.session = fields.session;
        self.parent_name = fields.parent_name;
        self.contact = fields.contact;
        self.total_fees = fields.total_fees;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Rejects amounts that are not positive or exceed the balance due.
    pub fn check_payment(&self, amount: &BigDecimal) -> Result<()> {
        self.check_direct_payment(amount, &BigDecimal::zero())
    }

    /// Like `check_payment`, with `pending` already owed through an
    /// outstanding fee request and so unavailable to a direct payment.
    pub fn check_direct_payment(&self, amount: &BigDecimal, pending: &BigDecimal) -> Result<()> {
        if *amount <= BigDecimal::zero() {
            return Err(AppError::Validation("Amount must be greater than 0".to_string()));
        }
        let due = self.balance_due() - pending;
        if *amount > due {
            let message = if pending.is_zero() {
                format!("Remaining due for {} is {}; cannot accept {}", self.name, due, amount)
            } else {
                format!(
                    "Remaining due for {} is {} ({} awaits a pending fee request); cannot accept {}",
                    self.name, due, pending, amount
                )
            };
            return Err(AppError::Validation(message));
        }
        Ok(())
    }

    /// Adds `amount` to the paid balance. A credit tied to a fee request is
    /// applied at most once; returns false when it was already applied.
    pub fn credit(&mut self, amount: &BigDecimal, request_id: Option<Uuid>) -> bool {
        if let Some(request_id) = request_id {
            if !self.credited_requests.insert(request_id) {
                return false;
            }
            self.is_request_sent = false;
        }
        self.paid_fees = &self.paid_fees + amount;
        self.updated_at = Utc::now();
        true
    }

    /// Case-insensitive name, exact roll number and class.
    pub fn matches_login(&self, name: &str, roll_no: &str, class_name: &str) -> bool {
        self.roll_no == roll_no.trim()
            && self.class_name == class_name.trim()
            && self.name.to_lowercase() == name.trim().to_lowercase()
    }

    pub fn public_view(&self) -> StudentPublic {
        StudentPublic {
            id: self.id,
            name: self.name.clone(),
            roll_no: self.roll_no.clone(),
            class_name: self.class_name.clone(),
            total_fees: self.total_fees.clone(),
            paid_fees: self.paid_fees.clone(),
        }
    }
}

/// Fields returned to a student after login.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StudentPublic {
    #[serde(rename = "_id")]
    pub id: Uuid,
    pub name: String,
    pub roll_no: String,
    #[serde(rename = "class")]
    pub class_name: String,
    #[serde(with = "money")]
    pub total_fees: BigDecimal,
    #[serde(with = "money")]
    pub paid_fees: BigDecimal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeeRequest {
    #[serde(rename = "_id")]
    pub id: Uuid,
    pub student_id: Uuid,
    pub student_name: String,
    #[serde(with = "money")]
    pub amount: BigDecimal,
    pub status: FeeRequestStatus,
    pub payment_mode: Option<PaymentMode>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payment_proof: Option<PaymentProof>,
    pub created_at: DateTime<Utc>,
    pub paid_at: Option<DateTime<Utc>>,
}

impl FeeRequest {
    pub fn pending(student: &Student, amount: BigDecimal) -> Self {
        Self {
            id: Uuid::new_v4(),
            student_id: student.id,
            student_name: student.name.clone(),
            amount,
            status: FeeRequestStatus::Pending,
            payment_mode: None,
            payment_proof: None,
            created_at: Utc::now(),
            paid_at: None,
        }
    }

    pub fn is_paid(&self) -> bool {
        self.status == FeeRequestStatus::Paid
    }

    /// Pending -> Paid. A request is settled once; later attempts conflict.
    pub fn settle(&mut self, mode: PaymentMode, proof: Option<PaymentProof>, at: DateTime<Utc>) -> Result<()> {
        if self.is_paid() {
            return Err(AppError::Conflict("Fee request is already paid".to_string()));
        }
        self.status = FeeRequestStatus::Paid;
        self.payment_mode = Some(mode);
        self.payment_proof = proof;
        self.paid_at = Some(at);
        Ok(())
    }

    /// Ledger entry for a settled request. It shares the request id so a
    /// repeated write lands on the same record.
    pub fn to_transaction(&self) -> Result<FeeTransaction> {
        let (Some(mode), Some(paid_at)) = (self.payment_mode, self.paid_at) else {
            return Err(AppError::Internal(format!("Fee request {} is not settled", self.id)));
        };
        Ok(FeeTransaction {
            id: self.id,
            student_id: self.student_id,
            student_name: self.student_name.clone(),
            amount: self.amount.clone(),
            payment_mode: mode,
            request_id: Some(self.id),
            payment_proof: self.payment_proof.clone(),
            date: paid_at,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeeTransaction {
    #[serde(rename = "_id")]
    pub id: Uuid,
    pub student_id: Uuid,
    pub student_name: String,
    #[serde(with = "money")]
    pub amount: BigDecimal,
    pub payment_mode: PaymentMode,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payment_proof: Option<PaymentProof>,
    pub date: DateTime<Utc>,
}

impl FeeTransaction {
    /// Walk-in payment recorded by an admin, not tied to a request.
    pub fn direct(student: &Student, amount: BigDecimal, mode: PaymentMode) -> Self {
        Self {
            id: Uuid::new_v4(),
            student_id: student.id,
            student_name: student.name.clone(),
            amount,
            payment_mode: mode,
            request_id: None,
            payment_proof: None,
            date: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    #[serde(rename = "_id")]
    pub id: Uuid,
    pub name: String,
    pub email: String,
    #[serde(skip_serializing)]
    pub password_hash: String,
    pub role: Role,
    pub created_at: DateTime<Utc>,
}

use async_trait::async_trait;
use bigdecimal::{BigDecimal, Zero};
use chrono::{DateTime, Utc};
use scylla::client::session::Session;
use scylla::client::session_builder::SessionBuilder;
use scylla::response::query_result::QueryResult;
use scylla::value::Row;
use scylla::DeserializeRow;
use std::collections::HashSet;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use uuid::Uuid;

use crate::config::DatabaseConfig;
use crate::db_migrate::MigrationTool;
use crate::error::{AppError, Result, TraceErr};
use crate::models::{
    FeeRequest, FeeRequestStatus, FeeTransaction, PaymentMode, PaymentProof, Role, Student, StudentFields, User,
};
use crate::store::FeeStore;

// Compare-and-set retries on a contended balance before giving up.
const MAX_CAS_ATTEMPTS: usize = 8;

const STUDENT_COLUMNS: &str = "student_id, name, roll_no, class_name, session, parent_name, contact, \
     total_fees, paid_fees, is_request_sent, credited_requests, created_at, updated_at";

const FEE_REQUEST_COLUMNS: &str = "request_id, student_id, student_name, amount, status, payment_mode, \
     proof_bank_name, proof_account_number, proof_transaction_id, created_at, paid_at";

const TRANSACTION_COLUMNS: &str = "transaction_id, student_id, student_name, amount, payment_mode, request_id, \
     proof_bank_name, proof_account_number, proof_transaction_id, paid_at";

#[derive(DeserializeRow)]
struct UserRow {
    user_id: Uuid,
    name: Option<String>,
    email: String,
    password_hash: String,
    role: Option<String>,
    created_at: Option<DateTime<Utc>>,
}

impl UserRow {
    fn into_user(self) -> Result<User> {
        Ok(User {
            id: self.user_id,
            name: self.name.unwrap_or_default(),
            email: self.email,
            password_hash: self.password_hash,
            role: self.role.as_deref().unwrap_or("Admin").parse::<Role>()?,
            created_at: self.created_at.unwrap_or_else(Utc::now),
        })
    }
}

#[derive(DeserializeRow)]
struct StudentRow {
    student_id: Uuid,
    name: String,
    roll_no: String,
    class_name: String,
    session: String,
    parent_name: Option<String>,
    contact: Option<String>,
    total_fees: BigDecimal,
    paid_fees: Option<BigDecimal>,
    is_request_sent: Option<bool>,
    credited_requests: Option<HashSet<Uuid>>,
    created_at: DateTime<Utc>,
    updated_at: Option<DateTime<Utc>>,
}

impl From<StudentRow> for Student {
    fn from(row: StudentRow) -> Self {
        Student {
            id: row.student_id,
            name: row.name,
            roll_no: row.roll_no,
            class_name: row.class_name,
            session: row.session,
            parent_name: row.parent_name.unwrap_or_default(),
            contact: row.contact.unwrap_or_default(),
            total_fees: row.total_fees,
            paid_fees: row.paid_fees.unwrap_or_default(),
            is_request_sent: row.is_request_sent.unwrap_or(false),
            credited_requests: row.credited_requests.unwrap_or_default(),
            created_at: row.created_at,
            updated_at: row.updated_at.unwrap_or(row.created_at),
        }
    }
}

#[derive(DeserializeRow)]
struct FeeRequestRow {
    request_id: Uuid,
    student_id: Uuid,
    student_name: String,
    amount: BigDecimal,
    status: String,
    payment_mode: Option<String>,
    proof_bank_name: Option<String>,
    proof_account_number: Option<String>,
    proof_transaction_id: Option<String>,
    created_at: DateTime<Utc>,
    paid_at: Option<DateTime<Utc>>,
}

impl FeeRequestRow {
    fn into_request(self) -> Result<FeeRequest> {
        Ok(FeeRequest {
            id: self.request_id,
            student_id: self.student_id,
            student_name: self.student_name,
            amount: self.amount,
            status: self.status.parse::<FeeRequestStatus>()?,
            // Legacy rows carry a placeholder mode while pending.
            payment_mode: self.payment_mode.and_then(|m| m.parse::<PaymentMode>().ok()),
            payment_proof: proof_from_columns(self.proof_bank_name, self.proof_account_number, self.proof_transaction_id),
            created_at: self.created_at,
            paid_at: self.paid_at,
        })
    }
}

#[derive(DeserializeRow)]
struct TransactionRow {
    transaction_id: Uuid,
    student_id: Uuid,
    student_name: String,
    amount: BigDecimal,
    payment_mode: String,
    request_id: Option<Uuid>,
    proof_bank_name: Option<String>,
    proof_account_number: Option<String>,
    proof_transaction_id: Option<String>,
    paid_at: DateTime<Utc>,
}

impl TransactionRow {
    fn into_transaction(self) -> Result<FeeTransaction> {
        Ok(FeeTransaction {
            id: self.transaction_id,
            student_id: self.student_id,
            student_name: self.student_name,
            amount: self.amount,
            payment_mode: self.payment_mode.parse::<PaymentMode>()
                .map_err(|_| AppError::Internal(format!("Unknown payment mode stored: {}", self.payment_mode)))?,
            request_id: self.request_id,
            payment_proof: proof_from_columns(self.proof_bank_name, self.proof_account_number, self.proof_transaction_id),
            date: self.paid_at,
        })
    }
}

fn proof_from_columns(
    student_bank_name: Option<String>,
    account_number: Option<String>,
    transaction_id: Option<String>,
) -> Option<PaymentProof> {
    PaymentProof {
        student_bank_name,
        account_number,
        transaction_id,
    }
    .normalized()
}

fn proof_columns(proof: &Option<PaymentProof>) -> (Option<String>, Option<String>, Option<String>) {
    match proof {
        Some(p) => (p.student_bank_name.clone(), p.account_number.clone(), p.transaction_id.clone()),
        None => (None, None, None),
    }
}

/// Balance compare-and-set. A request credit also records the request and
/// clears the outstanding flag; a direct credit touches neither.
fn credit_statement(request_credit: bool) -> &'static str {
    if request_credit {
        "UPDATE {ks}.student SET paid_fees = ?, credited_requests = ?, is_request_sent = false, updated_at = ? \
         WHERE student_id = ? IF paid_fees = ?"
    } else {
        "UPDATE {ks}.student SET paid_fees = ?, updated_at = ? WHERE student_id = ? IF paid_fees = ?"
    }
}

/// Runs `undo` when `result` is an error and hands back the original
/// result. A failing undo is logged, not returned.
async fn undo_on_error<T, F>(result: Result<T>, undo: F) -> Result<T>
where
    F: Future<Output = Result<()>>,
{
    if let Err(ref e) = result {
        tracing::warn!("Reverting partial write after: {}", e);
        if let Err(undo_err) = undo.await {
            tracing::error!("Revert failed: {}", undo_err);
        }
    }
    result
}

/// Reads the `[applied]` column of a conditional write.
fn lwt_applied(result: QueryResult) -> Result<bool> {
    let row = result.into_rows_result()?.first_row::<Row>()?;
    row.columns
        .first()
        .and_then(|c| c.as_ref())
        .and_then(|v| v.as_boolean())
        .ok_or_else(|| AppError::Internal("Conditional write returned no [applied] column".to_string()))
}

#[derive(Debug, Clone)]
pub struct ScyllaConnector {
    session: Arc<Session>,
    keyspace: String,
}

impl ScyllaConnector {
    pub async fn new(config: &DatabaseConfig) -> Result<Self> {
        let mut builder = SessionBuilder::new().known_nodes(&config.nodes);
        if let (Some(user), Some(password)) = (&config.user, &config.password) {
            builder = builder.user(user, password);
        }
        let session = builder.build().await?;
        tracing::info!("Connected to Scylla at {:?}", config.nodes);
        Ok(Self {
            session: Arc::new(session),
            keyspace: config.keyspace.clone(),
        })
    }

    /// Applies the bundled CQL migrations up to the configured version.
    pub async fn init_schema(&self, config: &DatabaseConfig) -> Result<()> {
        MigrationTool::new(
            self.keyspace.clone(),
            PathBuf::from(&config.schema_path),
            config.replication_factor,
        )
        .migrate_to_version(&self.session, config.schema_version)
        .await
    }

    fn cql(&self, template: &str) -> String {
        template.replace("{ks}", &self.keyspace)
    }

    async fn insert_transaction(&self, tx: &FeeTransaction) -> Result<()> {
        let (bank, account, utr) = proof_columns(&tx.payment_proof);
        self.session
            .query_unpaged(
                self.cql(&format!("INSERT INTO {{ks}}.fee_transaction ({}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)", TRANSACTION_COLUMNS)),
                (
                    tx.id,
                    tx.student_id,
                    &tx.student_name,
                    &tx.amount,
                    tx.payment_mode.as_str(),
                    tx.request_id,
                    bank,
                    account,
                    utr,
                    tx.date,
                ),
            )
            .await?;
        Ok(())
    }

    /// Adds `amount` to the student's balance with compare-and-set on
    /// `paid_fees`. With `check_due` the amount must fit in the balance due
    /// as stored at write time. Returns `None` when the student is gone.
    async fn credit_student(
        &self,
        student_id: Uuid,
        amount: &BigDecimal,
        request_id: Option<Uuid>,
        check_due: bool,
    ) -> Result<Option<Student>> {
        for attempt in 1..=MAX_CAS_ATTEMPTS {
            let Some(mut student) = self.get_student(student_id).await? else {
                return Ok(None);
            };
            let expected = student.paid_fees.clone();
            if check_due {
                let pending = self.pending_amount(student_id).await?;
                student.check_direct_payment(amount, &pending)?;
            }
            if !student.credit(amount, request_id) {
                tracing::debug!("Request {:?} already credited to {}", request_id, student_id);
                return Ok(Some(student));
            }

            let statement = self.cql(credit_statement(request_id.is_some()));
            let result = match request_id {
                Some(_) => {
                    self.session
                        .query_unpaged(
                            statement,
                            (
                                &student.paid_fees,
                                &student.credited_requests,
                                student.updated_at,
                                student_id,
                                &expected,
                            ),
                        )
                        .await?
                }
                None => {
                    self.session
                        .query_unpaged(statement, (&student.paid_fees, student.updated_at, student_id, &expected))
                        .await?
                }
            };
            if lwt_applied(result)? {
                return Ok(Some(student));
            }
            tracing::debug!("Balance of {} changed underneath, attempt {}", student_id, attempt);
        }
        Err(AppError::Unavailable(format!("Balance of student {} is under contention", student_id)))
    }

    /// Ledger write, balance credit and pending-slot release for a request
    /// already flipped to Paid. Every step is idempotent.
    async fn finish_settlement(&self, request: &FeeRequest) -> Result<FeeTransaction> {
        let transaction = request.to_transaction()?;
        self.insert_transaction(&transaction).await.trace_err("ledger write")?;
        if self
            .credit_student(request.student_id, &request.amount, Some(request.id), false)
            .await
            .trace_err("request credit")?
            .is_none()
        {
            tracing::warn!("Fee request {} settled for deleted student {}", request.id, request.student_id);
        }
        self.release_pending_slot(request.student_id, request.id).await?;
        Ok(transaction)
    }

    async fn release_pending_slot(&self, student_id: Uuid, request_id: Uuid) -> Result<()> {
        self.session
            .query_unpaged(
                self.cql("DELETE FROM {ks}.pending_fee_request WHERE student_id = ? IF request_id = ?"),
                (student_id, request_id),
            )
            .await?;
        Ok(())
    }

    /// Amount of the student's pending request, zero when there is none.
    async fn pending_amount(&self, student_id: Uuid) -> Result<BigDecimal> {
        let Some(request_id) = self.pending_slot(student_id).await? else {
            return Ok(BigDecimal::zero());
        };
        Ok(self
            .get_fee_request(request_id)
            .await?
            .filter(|r| !r.is_paid())
            .map(|r| r.amount)
            .unwrap_or_else(BigDecimal::zero))
    }

    async fn pending_slot(&self, student_id: Uuid) -> Result<Option<Uuid>> {
        let rows = self
            .session
            .query_unpaged(
                self.cql("SELECT request_id FROM {ks}.pending_fee_request WHERE student_id = ?"),
                (student_id,),
            )
            .await?
            .into_rows_result()?;
        Ok(rows.maybe_first_row::<(Option<Uuid>,)>()?.and_then(|(id,)| id))
    }

    async fn claim_student_key(&self, fields_key: (&str, &str, &str), student_id: Uuid) -> Result<bool> {
        let (roll_no, class_name, session) = fields_key;
        let result = self
            .session
            .query_unpaged(
                self.cql(
                    "INSERT INTO {ks}.student_by_roll (roll_no, class_name, session, student_id) \
                     VALUES (?, ?, ?, ?) IF NOT EXISTS",
                ),
                (roll_no, class_name, session, student_id),
            )
            .await?;
        lwt_applied(result)
    }

    /// Claims the email, then writes the user row. The claim is released if
    /// the row write fails.
    async fn insert_user_rows(&self, user: &User) -> Result<()> {
        let claimed = self
            .session
            .query_unpaged(
                self.cql("INSERT INTO {ks}.user_by_email (email, user_id) VALUES (?, ?) IF NOT EXISTS"),
                (&user.email, user.id),
            )
            .await?;
        if !lwt_applied(claimed)? {
            return Err(AppError::DuplicateEmail("User already exists with this email.".to_string()));
        }

        let result = self
            .session
            .query_unpaged(
                self.cql(
                    "INSERT INTO {ks}.app_user (user_id, name, email, password_hash, role, created_at) \
                     VALUES (?, ?, ?, ?, ?, ?)",
                ),
                (user.id, &user.name, &user.email, &user.password_hash, user.role.as_str(), user.created_at),
            )
            .await
            .map(|_| ())
            .map_err(AppError::from);
        undo_on_error(result, async {
            self.session
                .query_unpaged(
                    self.cql("DELETE FROM {ks}.user_by_email WHERE email = ? IF user_id = ?"),
                    (&user.email, user.id),
                )
                .await?;
            Ok::<(), AppError>(())
        })
        .await
    }

    async fn release_student_key(&self, key: (&str, &str, &str), student_id: Uuid) -> Result<()> {
        let (roll_no, class_name, session) = key;
        self.session
            .query_unpaged(
                self.cql(
                    "DELETE FROM {ks}.student_by_roll WHERE roll_no = ? AND class_name = ? AND session = ? \
                     IF student_id = ?",
                ),
                (roll_no, class_name, session, student_id),
            )
            .await?;
        Ok(())
    }
}

#[async_trait]
impl FeeStore for ScyllaConnector {
    async fn count_users(&self) -> Result<usize> {
        let rows = self
            .session
            .query_unpaged(self.cql("SELECT COUNT(*) FROM {ks}.app_user"), &[])
            .await?
            .into_rows_result()?;
        let (count,) = rows.first_row::<(i64,)>()?;
        Ok(count.max(0) as usize)
    }

    async fn insert_user(&self, user: &User, bootstrap: bool) -> Result<()> {
        if bootstrap {
            let first = self
                .session
                .query_unpaged(
                    self.cql("INSERT INTO {ks}.admin_bootstrap (singleton, user_id) VALUES (0, ?) IF NOT EXISTS"),
                    (user.id,),
                )
                .await?;
            if !lwt_applied(first)? {
                return Err(AppError::Forbidden("Only an admin can register new users".to_string()));
            }
        }

        let result = self.insert_user_rows(user).await;
        undo_on_error(result, async {
            if bootstrap {
                self.session
                    .query_unpaged(
                        self.cql("DELETE FROM {ks}.admin_bootstrap WHERE singleton = 0 IF user_id = ?"),
                        (user.id,),
                    )
                    .await?;
            }
            Ok::<(), AppError>(())
        })
        .await
    }

    async fn get_user_by_email(&self, email: &str) -> Result<Option<User>> {
        let rows = self
            .session
            .query_unpaged(self.cql("SELECT user_id FROM {ks}.user_by_email WHERE email = ?"), (email,))
            .await?
            .into_rows_result()?;
        let Some((user_id,)) = rows.maybe_first_row::<(Uuid,)>()? else {
            return Ok(None);
        };

        let rows = self
            .session
            .query_unpaged(
                self.cql(
                    "SELECT user_id, name, email, password_hash, role, created_at FROM {ks}.app_user WHERE user_id = ?",
                ),
                (user_id,),
            )
            .await?
            .into_rows_result()?;
        match rows.maybe_first_row::<UserRow>()? {
            Some(row) => Ok(Some(row.into_user()?)),
            None => {
                // Email claimed but the user row never landed.
                tracing::error!("Email {} maps to missing user {}", email, user_id);
                Ok(None)
            }
        }
    }

    async fn insert_student(&self, student: &Student) -> Result<()> {
        let key = (student.roll_no.as_str(), student.class_name.as_str(), student.session.as_str());
        if !self.claim_student_key(key, student.id).await? {
            return Err(AppError::Conflict(
                "Student with same Roll No already exists in this Class & Session".to_string(),
            ));
        }

        let result = self
            .session
            .query_unpaged(
                self.cql(&format!(
                    "INSERT INTO {{ks}}.student ({}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?) IF NOT EXISTS",
                    STUDENT_COLUMNS
                )),
                (
                    student.id,
                    &student.name,
                    &student.roll_no,
                    &student.class_name,
                    &student.session,
                    &student.parent_name,
                    &student.contact,
                    &student.total_fees,
                    &student.paid_fees,
                    student.is_request_sent,
                    &student.credited_requests,
                    student.created_at,
                    student.updated_at,
                ),
            )
            .await
            .map_err(AppError::from)
            .and_then(|r| match lwt_applied(r)? {
                true => Ok(()),
                false => Err(AppError::Internal(format!("Student id {} already in use", student.id))),
            });
        undo_on_error(result, self.release_student_key(key, student.id)).await
    }

    async fn update_student(&self, id: Uuid, fields: StudentFields) -> Result<Student> {
        let current = self
            .get_student(id)
            .await?
            .ok_or_else(|| AppError::NotFound("Student not found".to_string()))?;
        let mut updated = current.clone();
        updated.apply_fields(fields)?;

        let old_key = current.key();
        let new_key = updated.key();
        let key_changed = old_key != new_key;
        let new_key_ref = (new_key.roll_no.as_str(), new_key.class_name.as_str(), new_key.session.as_str());
        if key_changed && !self.claim_student_key(new_key_ref, id).await? {
            return Err(AppError::Conflict(
                "Another student already exists with same Roll No, Class & Session".to_string(),
            ));
        }

        let result = self
            .session
            .query_unpaged(
                self.cql(
                    "UPDATE {ks}.student SET name = ?, roll_no = ?, class_name = ?, session = ?, parent_name = ?, \
                     contact = ?, total_fees = ?, updated_at = ? WHERE student_id = ? IF EXISTS",
                ),
                (
                    &updated.name,
                    &updated.roll_no,
                    &updated.class_name,
                    &updated.session,
                    &updated.parent_name,
                    &updated.contact,
                    &updated.total_fees,
                    updated.updated_at,
                    id,
                ),
            )
            .await?;

        if !lwt_applied(result)? {
            if key_changed {
                self.release_student_key(new_key_ref, id).await?;
            }
            return Err(AppError::NotFound("Student not found".to_string()));
        }
        if key_changed {
            self.release_student_key(
                (old_key.roll_no.as_str(), old_key.class_name.as_str(), old_key.session.as_str()),
                id,
            )
            .await?;
        }
        Ok(updated)
    }

    async fn delete_student(&self, id: Uuid) -> Result<bool> {
        let Some(student) = self.get_student(id).await? else {
            return Ok(false);
        };
        let result = self
            .session
            .query_unpaged(self.cql("DELETE FROM {ks}.student WHERE student_id = ? IF EXISTS"), (id,))
            .await?;
        if !lwt_applied(result)? {
            return Ok(false);
        }
        self.release_student_key(
            (student.roll_no.as_str(), student.class_name.as_str(), student.session.as_str()),
            id,
        )
        .await?;
        Ok(true)
    }

    async fn get_student(&self, id: Uuid) -> Result<Option<Student>> {
        let rows = self
            .session
            .query_unpaged(
                self.cql(&format!("SELECT {} FROM {{ks}}.student WHERE student_id = ?", STUDENT_COLUMNS)),
                (id,),
            )
            .await?
            .into_rows_result()?;
        Ok(rows.maybe_first_row::<StudentRow>()?.map(Student::from))
    }

    async fn list_students(&self) -> Result<Vec<Student>> {
        let rows = self
            .session
            .query_unpaged(self.cql(&format!("SELECT {} FROM {{ks}}.student", STUDENT_COLUMNS)), &[])
            .await?
            .into_rows_result()?;
        let mut students = Vec::new();
        for row in rows.rows::<StudentRow>()? {
            students.push(Student::from(row?));
        }
        Ok(students)
    }

    async fn find_students_by_roll(&self, roll_no: &str, class_name: &str) -> Result<Vec<Student>> {
        let rows = self
            .session
            .query_unpaged(
                self.cql("SELECT student_id FROM {ks}.student_by_roll WHERE roll_no = ? AND class_name = ?"),
                (roll_no, class_name),
            )
            .await?
            .into_rows_result()?;
        let mut students = Vec::new();
        for row in rows.rows::<(Uuid,)>()? {
            let (student_id,) = row?;
            if let Some(student) = self.get_student(student_id).await? {
                students.push(student);
            }
        }
        Ok(students)
    }

    async fn create_fee_request(&self, request: &FeeRequest) -> Result<()> {
        if self.get_student(request.student_id).await?.is_none() {
            return Err(AppError::NotFound("Student not found".to_string()));
        }

        // Second pass only runs after clearing a stale slot.
        for _ in 0..2 {
            let claimed = self
                .session
                .query_unpaged(
                    self.cql("INSERT INTO {ks}.pending_fee_request (student_id, request_id) VALUES (?, ?) IF NOT EXISTS"),
                    (request.student_id, request.id),
                )
                .await?;
            if lwt_applied(claimed)? {
                self.session
                    .query_unpaged(
                        self.cql(&format!(
                            "INSERT INTO {{ks}}.fee_request ({}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
                            FEE_REQUEST_COLUMNS
                        )),
                        (
                            request.id,
                            request.student_id,
                            &request.student_name,
                            &request.amount,
                            request.status.as_str(),
                            request.payment_mode.map(|m| m.as_str()),
                            None::<String>,
                            None::<String>,
                            None::<String>,
                            request.created_at,
                            request.paid_at,
                        ),
                    )
                    .await?;
                let flagged = self
                    .session
                    .query_unpaged(
                        self.cql("UPDATE {ks}.student SET is_request_sent = true WHERE student_id = ? IF EXISTS"),
                        (request.student_id,),
                    )
                    .await?;
                if !lwt_applied(flagged)? {
                    tracing::warn!("Request {} created for missing student {}", request.id, request.student_id);
                }
                return Ok(());
            }

            // The slot is taken: either a live pending request, or one whose
            // settlement (or creation) was cut short.
            let Some(holder) = self.pending_slot(request.student_id).await? else {
                continue;
            };
            match self.get_fee_request(holder).await? {
                Some(existing) if !existing.is_paid() => {
                    return Err(AppError::Conflict("Fee request already sent to this student".to_string()));
                }
                Some(existing) => {
                    tracing::warn!("Completing interrupted settlement of fee request {}", existing.id);
                    self.finish_settlement(&existing).await?;
                }
                None => {
                    tracing::warn!("Releasing pending slot of {} held by missing request {}", request.student_id, holder);
                    self.release_pending_slot(request.student_id, holder).await?;
                }
            }
        }
        Err(AppError::Conflict("Fee request already sent to this student".to_string()))
    }

    async fn get_fee_request(&self, id: Uuid) -> Result<Option<FeeRequest>> {
        let rows = self
            .session
            .query_unpaged(
                self.cql(&format!("SELECT {} FROM {{ks}}.fee_request WHERE request_id = ?", FEE_REQUEST_COLUMNS)),
                (id,),
            )
            .await?
            .into_rows_result()?;
        match rows.maybe_first_row::<FeeRequestRow>()? {
            Some(row) => Ok(Some(row.into_request()?)),
            None => Ok(None),
        }
    }

    async fn pending_fee_requests(&self, student_id: Uuid) -> Result<Vec<FeeRequest>> {
        let Some(request_id) = self.pending_slot(student_id).await? else {
            return Ok(Vec::new());
        };
        Ok(self
            .get_fee_request(request_id)
            .await?
            .filter(|r| !r.is_paid())
            .into_iter()
            .collect())
    }

    async fn settle_fee_request(
        &self,
        id: Uuid,
        mode: PaymentMode,
        proof: Option<PaymentProof>,
        at: DateTime<Utc>,
    ) -> Result<FeeTransaction> {
        let mut request = self
            .get_fee_request(id)
            .await?
            .ok_or_else(|| AppError::NotFound("Fee request not found".to_string()))?;

        let (bank, account, utr) = proof_columns(&proof);
        let flipped = self
            .session
            .query_unpaged(
                self.cql(
                    "UPDATE {ks}.fee_request SET status = ?, payment_mode = ?, proof_bank_name = ?, \
                     proof_account_number = ?, proof_transaction_id = ?, paid_at = ? \
                     WHERE request_id = ? IF status = ?",
                ),
                (
                    FeeRequestStatus::Paid.as_str(),
                    mode.as_str(),
                    bank,
                    account,
                    utr,
                    at,
                    id,
                    FeeRequestStatus::Pending.as_str(),
                ),
            )
            .await?;

        if !lwt_applied(flipped)? {
            // Another resolution won. Make sure its effects are complete
            // before reporting the conflict.
            if let Some(settled) = self.get_fee_request(id).await?.filter(|r| r.is_paid()) {
                if settled.payment_mode.is_some() && settled.paid_at.is_some() {
                    self.finish_settlement(&settled).await?;
                }
            }
            return Err(AppError::Conflict("Fee request is already paid".to_string()));
        }

        request.settle(mode, proof, at)?;
        self.finish_settlement(&request).await
    }

    async fn record_payment(&self, transaction: &FeeTransaction) -> Result<Student> {
        let student = self
            .credit_student(transaction.student_id, &transaction.amount, None, true)
            .await?
            .ok_or_else(|| AppError::NotFound("Student not found".to_string()))?;

        let written = self.insert_transaction(transaction).await;
        undo_on_error(written, async {
            let reversal = -transaction.amount.clone();
            self.credit_student(transaction.student_id, &reversal, None, false)
                .await
                .trace_err("credit reversal")?;
            Ok::<(), AppError>(())
        })
        .await?;
        Ok(student)
    }

    async fn list_transactions(&self, student_id: Option<Uuid>) -> Result<Vec<FeeTransaction>> {
        let result = match student_id {
            Some(id) => {
                self.session
                    .query_unpaged(
                        self.cql(&format!("SELECT {} FROM {{ks}}.fee_transaction WHERE student_id = ?", TRANSACTION_COLUMNS)),
                        (id,),
                    )
                    .await?
            }
            None => {
                self.session
                    .query_unpaged(self.cql(&format!("SELECT {} FROM {{ks}}.fee_transaction", TRANSACTION_COLUMNS)), &[])
                    .await?
            }
        };
        let rows = result.into_rows_result()?;
        let mut transactions = Vec::new();
        for row in rows.rows::<TransactionRow>()? {
            transactions.push(row?.into_transaction()?);
        }
        transactions.sort_by(|a, b| b.date.cmp(&a.date));
        Ok(transactions)
    }

    async fn shutdown(&self) -> Result<()> {
        tracing::info!("Closing Scylla session");
        Ok(())
    }
}

use bigdecimal::{BigDecimal, Zero};
use chrono::Utc;
use email_address::EmailAddress;
use std::cmp::Ordering;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::api::{
    parse_id, BulkFailure, BulkSendReport, BulkSkip, CreateFeeRequest, PayFeeRequest, RecordPaymentRequest,
    RegisterRequest, StudentLoginRequest, StudentPayload,
};
use crate::auth::{hash_password, verify_password, LoggedUser, SessionKeys};
use crate::config::BulkConfig;
use crate::error::{AppError, Result};
use crate::models::{FeeRequest, FeeTransaction, PaymentMode, Role, Student, User};
use crate::store::FeeStore;

const MIN_PASSWORD_LEN: usize = 8;

#[derive(Clone)]
pub struct StoreStateManager {
    pub store: Arc<dyn FeeStore>,
    pub keys: SessionKeys,
    bulk: BulkConfig,
}

/// Roll numbers compare numerically when both are numbers, else as text.
fn compare_roll(a: &str, b: &str) -> Ordering {
    match (a.parse::<u64>(), b.parse::<u64>()) {
        (Ok(x), Ok(y)) => x.cmp(&y).then_with(|| a.cmp(b)),
        _ => a.cmp(b),
    }
}

fn positive_amount(amount: Option<BigDecimal>) -> Result<BigDecimal> {
    let amount = amount.ok_or_else(|| AppError::Validation("amount is required".to_string()))?;
    if amount <= BigDecimal::zero() {
        return Err(AppError::Validation("Amount must be greater than 0".to_string()));
    }
    Ok(amount)
}

fn payment_mode(raw: Option<&str>) -> Result<PaymentMode> {
    let raw = raw
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| AppError::Validation("paymentMode is required".to_string()))?;
    PaymentMode::from_str(raw)
}

impl StoreStateManager {
    pub fn new(store: Arc<dyn FeeStore>, keys: SessionKeys, bulk: BulkConfig) -> Self {
        Self { store, keys, bulk }
    }

    /// Admin login. Unknown email and wrong password are indistinguishable.
    pub async fn authenticate_admin(&self, email: &str, password: &str) -> Result<(User, String)> {
        let email = email.trim().to_lowercase();
        let user = match self.store.get_user_by_email(&email).await? {
            Some(user) if verify_password(password, &user.password_hash)? => user,
            Some(_) => {
                tracing::info!("Wrong password for {}", email);
                return Err(AppError::Unauthorized("Invalid credentials".to_string()));
            }
            None => {
                tracing::info!("Login attempt for unknown email {}", email);
                return Err(AppError::Unauthorized("Invalid credentials".to_string()));
            }
        };
        let token = self.keys.issue(user.id, user.role)?;
        Ok((user, token))
    }

    /// Creates an admin. Open only while no user exists; afterwards the caller
    /// must already be an admin.
    pub async fn register(&self, caller: Option<&LoggedUser>, req: RegisterRequest) -> Result<User> {
        let name = req.name.trim().to_string();
        let email = req.email.trim().to_lowercase();
        if name.is_empty() || email.is_empty() || req.password.is_empty() {
            return Err(AppError::Validation("Name, email and password are required".to_string()));
        }
        if !EmailAddress::is_valid(&email) {
            return Err(AppError::Validation(format!("'{}' is not a valid email address", email)));
        }
        if req.password.len() < MIN_PASSWORD_LEN {
            return Err(AppError::Validation(format!(
                "Password must be at least {} characters",
                MIN_PASSWORD_LEN
            )));
        }

        // The store re-checks a bootstrap insert atomically; this read only
        // turns away the common case early.
        let granted_by = match caller {
            Some(user) if user.is_admin() => Some(user.user_id),
            _ if self.store.count_users().await? == 0 => None,
            _ => return Err(AppError::Forbidden("Only an admin can register new users".to_string())),
        };

        let user = User {
            id: Uuid::new_v4(),
            name,
            email,
            password_hash: hash_password(&req.password)?,
            role: Role::Admin,
            created_at: Utc::now(),
        };
        self.store.insert_user(&user, granted_by.is_none()).await?;

        match granted_by {
            Some(admin) => tracing::info!(target: "audit", "Admin role granted to {} ({}) by {}", user.email, user.id, admin),
            None => tracing::info!(target: "audit", "Bootstrap admin {} ({}) created", user.email, user.id),
        }
        Ok(user)
    }

    /// Student login by name, roll number and class. Returns the student and
    /// a student-role session token.
    pub async fn student_login(&self, req: StudentLoginRequest) -> Result<(Student, String)> {
        let (Some(name), Some(roll_no), Some(class_name)) = (req.name, req.roll_no, req.class_name) else {
            return Err(AppError::Validation("Name, roll number and class are required".to_string()));
        };
        if name.trim().is_empty() || roll_no.trim().is_empty() || class_name.trim().is_empty() {
            return Err(AppError::Validation("Name, roll number and class are required".to_string()));
        }

        let mut candidates = self
            .store
            .find_students_by_roll(roll_no.trim(), class_name.trim())
            .await?
            .into_iter()
            .filter(|s| s.matches_login(&name, &roll_no, &class_name))
            .collect::<Vec<_>>();
        // Same roll and class across sessions: the latest enrollment wins.
        candidates.sort_by(|a, b| b.session.cmp(&a.session));
        let student = candidates
            .into_iter()
            .next()
            .ok_or_else(|| AppError::Unauthorized("Record not found".to_string()))?;

        let token = self.keys.issue(student.id, Role::Student)?;
        Ok((student, token))
    }

    pub async fn create_student(&self, payload: StudentPayload) -> Result<Student> {
        let student = Student::new(payload.into_fields()?);
        self.store.insert_student(&student).await?;
        tracing::info!("Student {} added to {} ({})", student.id, student.class_name, student.session);
        Ok(student)
    }

    pub async fn list_students(&self) -> Result<Vec<Student>> {
        let mut students = self.store.list_students().await?;
        students.sort_by(|a, b| compare_roll(&a.roll_no, &b.roll_no).then_with(|| a.class_name.cmp(&b.class_name)));
        Ok(students)
    }

    pub async fn update_student(&self, mut payload: StudentPayload) -> Result<Student> {
        let id = parse_id(payload.id.take().as_deref(), "_id")?;
        let fields = payload.into_fields()?;
        self.store.update_student(id, fields).await
    }

    pub async fn delete_student(&self, id: Option<&str>) -> Result<()> {
        let id = parse_id(id, "id")?;
        if !self.store.delete_student(id).await? {
            return Err(AppError::NotFound("Student not found".to_string()));
        }
        tracing::info!("Student {} deleted", id);
        Ok(())
    }

    pub async fn create_fee_request(&self, req: CreateFeeRequest) -> Result<FeeRequest> {
        let student_id = parse_id(req.student_id.as_deref(), "studentId")?;
        let amount = positive_amount(req.amount)?;
        let student = self
            .store
            .get_student(student_id)
            .await?
            .ok_or_else(|| AppError::NotFound("Student not found".to_string()))?;
        student.check_payment(&amount)?;

        let request = FeeRequest::pending(&student, amount);
        self.store.create_fee_request(&request).await?;
        tracing::info!("Fee request {} of {} sent to {}", request.id, request.amount, student.id);
        Ok(request)
    }

    pub async fn pending_requests(&self, user: &LoggedUser, student_id: Option<&str>) -> Result<Vec<FeeRequest>> {
        let student_id = parse_id(student_id, "studentId")?;
        user.ensure_can_access(student_id)?;
        self.store.pending_fee_requests(student_id).await
    }

    pub async fn pay_fee_request(&self, user: &LoggedUser, req: PayFeeRequest) -> Result<FeeTransaction> {
        let request_id = parse_id(req.request_id.as_deref(), "requestId")?;
        let request = self
            .store
            .get_fee_request(request_id)
            .await?
            .ok_or_else(|| AppError::NotFound("Fee request not found".to_string()))?;
        user.ensure_can_access(request.student_id)?;

        if request.is_paid() {
            // The store finishes any interrupted settlement, then conflicts.
            let mode = request.payment_mode.unwrap_or(PaymentMode::Cash);
            return self.store.settle_fee_request(request_id, mode, None, Utc::now()).await;
        }

        let mode = payment_mode(req.payment_mode.as_deref())?;
        let proof = req.proof.normalized();
        if mode == PaymentMode::Bank && proof.as_ref().and_then(|p| p.transaction_id.as_ref()).is_none() {
            return Err(AppError::Validation("transactionId is required for bank transfers".to_string()));
        }

        let transaction = self
            .store
            .settle_fee_request(request_id, mode, proof, Utc::now())
            .await?;
        tracing::info!(
            "Fee request {} paid by {:?} {} via {}",
            request_id, user.role, user.user_id, mode
        );
        Ok(transaction)
    }

    pub async fn record_payment(&self, req: RecordPaymentRequest) -> Result<FeeTransaction> {
        let student_id = parse_id(req.student_id.as_deref(), "studentId")?;
        let amount = positive_amount(req.amount)?;
        let mode = payment_mode(req.payment_mode.as_deref())?;
        let student = self
            .store
            .get_student(student_id)
            .await?
            .ok_or_else(|| AppError::NotFound("Student not found".to_string()))?;
        let pending = self
            .store
            .pending_fee_requests(student_id)
            .await?
            .iter()
            .fold(BigDecimal::zero(), |sum, r| sum + &r.amount);
        student.check_direct_payment(&amount, &pending)?;

        let transaction = FeeTransaction::direct(&student, amount, mode);
        let updated = self.store.record_payment(&transaction).await?;
        tracing::info!(
            "Payment {} of {} recorded for {}; paid {} of {}",
            transaction.id, transaction.amount, student_id, updated.paid_fees, updated.total_fees
        );
        Ok(transaction)
    }

    /// Admins may list every transaction; students only their own.
    pub async fn list_transactions(&self, user: &LoggedUser, student_id: Option<&str>) -> Result<Vec<FeeTransaction>> {
        let filter = match student_id.map(str::trim).filter(|s| !s.is_empty()) {
            Some(raw) => Some(parse_id(Some(raw), "studentId")?),
            None => None,
        };
        let filter = match (user.is_admin(), filter) {
            (true, filter) => filter,
            (false, Some(id)) => {
                user.ensure_can_access(id)?;
                Some(id)
            }
            (false, None) => Some(user.user_id),
        };
        self.store.list_transactions(filter).await
    }

    /// Sends a request for the full balance due to every student that owes
    /// money. Students with a pending request come back from the store as a
    /// conflict and are reported as skipped. Students are handled one at a time.
    pub async fn bulk_send(&self) -> Result<BulkSendReport> {
        let mut report = BulkSendReport::default();
        for student in self.list_students().await? {
            let due = student.balance_due();
            if due <= BigDecimal::zero() {
                report.skipped.push(BulkSkip {
                    student_id: student.id,
                    reason: "No balance due".to_string(),
                });
                continue;
            }

            let request = FeeRequest::pending(&student, due);
            match self.create_with_retry(&request).await {
                Ok(()) => report.sent.push(student.id),
                Err((AppError::Conflict(reason), _)) => report.skipped.push(BulkSkip {
                    student_id: student.id,
                    reason,
                }),
                Err((e, attempts)) => {
                    tracing::error!("Bulk send to {} failed after {} attempts: {}", student.id, attempts, e);
                    report.failed.push(BulkFailure {
                        student_id: student.id,
                        message: e.public_message(),
                        attempts,
                    });
                }
            }
        }
        tracing::info!(
            "Bulk send finished: {} sent, {} skipped, {} failed",
            report.sent.len(),
            report.skipped.len(),
            report.failed.len()
        );
        Ok(report)
    }

    async fn create_with_retry(&self, request: &FeeRequest) -> std::result::Result<(), (AppError, u32)> {
        let mut attempt = 1;
        loop {
            match self.store.create_fee_request(request).await {
                Ok(()) => return Ok(()),
                Err(e) if e.is_transient() && attempt < self.bulk.max_attempts => {
                    let delay = self.bulk.base_delay_ms.saturating_mul(1 << (attempt - 1).min(16));
                    tracing::warn!(
                        "Fee request for {} failed (attempt {}), retrying in {}ms: {}",
                        request.student_id, attempt, delay, e
                    );
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                    attempt += 1;
                }
                Err(e) => return Err((e, attempt)),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AuthConfig;
    use crate::memory::MemoryStore;
    use crate::models::{FeeRequestStatus, PaymentProof, StudentFields};
    use crate::store::FeeStore;
    use async_trait::async_trait;
    use chrono::DateTime;
    use std::sync::atomic::{AtomicU32, Ordering as AtomicOrdering};

    fn keys() -> SessionKeys {
        SessionKeys::new(&AuthConfig {
            session_secret: "state-test-secret-0123456789abcdefghij".to_string(),
            session_hours: 1,
            secure_cookies: false,
        })
    }

    fn bulk() -> BulkConfig {
        BulkConfig {
            max_attempts: 3,
            base_delay_ms: 1,
        }
    }

    fn manager() -> StoreStateManager {
        StoreStateManager::new(Arc::new(MemoryStore::new()), keys(), bulk())
    }

    fn admin() -> LoggedUser {
        LoggedUser { user_id: Uuid::new_v4(), role: Role::Admin, expire_ts: 0 }
    }

    fn payload(name: &str, roll_no: &str, total: i64) -> StudentPayload {
        serde_json::from_value(serde_json::json!({
            "name": name,
            "rollNo": roll_no,
            "class": "8A",
            "session": "2024-25",
            "totalFees": total
        }))
        .unwrap()
    }

    fn fee_request(student: &Student, amount: i64) -> CreateFeeRequest {
        CreateFeeRequest {
            student_id: Some(student.id.to_string()),
            amount: Some(BigDecimal::from(amount)),
        }
    }

    fn pay(request: &FeeRequest, mode: &str) -> PayFeeRequest {
        PayFeeRequest {
            request_id: Some(request.id.to_string()),
            payment_mode: Some(mode.to_string()),
            proof: PaymentProof::default(),
        }
    }

    #[tokio::test]
    async fn duplicate_student_key_conflicts() {
        let state = manager();
        state.create_student(payload("Rahul", "12", 5000)).await.unwrap();
        let err = state.create_student(payload("Someone Else", "12", 4000)).await.unwrap_err();
        assert!(matches!(err, AppError::Conflict(_)));
        assert_eq!(state.list_students().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn roster_is_sorted_by_roll_number() {
        let state = manager();
        for roll in ["10", "2", "B1", "1"] {
            state.create_student(payload("S", roll, 100)).await.unwrap();
        }
        let rolls: Vec<String> = state.list_students().await.unwrap().into_iter().map(|s| s.roll_no).collect();
        assert_eq!(rolls, vec!["1", "2", "10", "B1"]);
    }

    #[tokio::test]
    async fn direct_payment_credits_balance_and_ledger() {
        let state = manager();
        let student = state.create_student(payload("Rahul", "12", 5000)).await.unwrap();
        state
            .record_payment(RecordPaymentRequest {
                student_id: Some(student.id.to_string()),
                amount: Some(BigDecimal::from(2000)),
                payment_mode: Some("Online".to_string()),
            })
            .await
            .unwrap();

        let tx = state
            .record_payment(RecordPaymentRequest {
                student_id: Some(student.id.to_string()),
                amount: Some(BigDecimal::from(1000)),
                payment_mode: Some("cash".to_string()),
            })
            .await
            .unwrap();
        assert_eq!(tx.payment_mode, PaymentMode::Cash);

        let stored = state.store.get_student(student.id).await.unwrap().unwrap();
        assert_eq!(stored.paid_fees, BigDecimal::from(3000));
        let ledger = state.list_transactions(&admin(), Some(&student.id.to_string())).await.unwrap();
        assert_eq!(ledger.len(), 2);
        assert_eq!(ledger[0].amount, BigDecimal::from(1000));
    }

    #[tokio::test]
    async fn direct_payment_never_exceeds_total() {
        let state = manager();
        let student = state.create_student(payload("Rahul", "12", 5000)).await.unwrap();
        let err = state
            .record_payment(RecordPaymentRequest {
                student_id: Some(student.id.to_string()),
                amount: Some(BigDecimal::from(5001)),
                payment_mode: Some("Cash".to_string()),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
        assert!(err.to_string().contains("Remaining due"));

        let err = state
            .record_payment(RecordPaymentRequest {
                student_id: Some(student.id.to_string()),
                amount: Some(BigDecimal::from(10)),
                payment_mode: Some("Cheque".to_string()),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
        assert!(state.store.list_transactions(None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn second_pending_request_conflicts() {
        let state = manager();
        let student = state.create_student(payload("Rahul", "12", 5000)).await.unwrap();
        let request = state.create_fee_request(fee_request(&student, 1500)).await.unwrap();
        assert_eq!(request.status, FeeRequestStatus::Pending);

        let err = state.create_fee_request(fee_request(&student, 500)).await.unwrap_err();
        assert!(matches!(err, AppError::Conflict(_)));
        assert_eq!(
            state.pending_requests(&admin(), Some(&student.id.to_string())).await.unwrap().len(),
            1
        );
    }

    #[tokio::test]
    async fn request_over_balance_is_rejected() {
        let state = manager();
        let student = state.create_student(payload("Rahul", "12", 5000)).await.unwrap();
        let err = state.create_fee_request(fee_request(&student, 6000)).await.unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));

        let err = state
            .create_fee_request(CreateFeeRequest {
                student_id: Some(Uuid::new_v4().to_string()),
                amount: Some(BigDecimal::from(10)),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
    }

    #[tokio::test]
    async fn paying_twice_credits_once() {
        let state = manager();
        let student = state.create_student(payload("Rahul", "12", 5000)).await.unwrap();
        let request = state.create_fee_request(fee_request(&student, 2000)).await.unwrap();
        let owner = LoggedUser { user_id: student.id, role: Role::Student, expire_ts: 0 };

        let tx = state.pay_fee_request(&owner, pay(&request, "UPI")).await.unwrap();
        assert_eq!(tx.amount, BigDecimal::from(2000));
        assert_eq!(tx.request_id, Some(request.id));

        let err = state.pay_fee_request(&owner, pay(&request, "Cash")).await.unwrap_err();
        assert!(matches!(err, AppError::Conflict(_)));

        let stored = state.store.get_student(student.id).await.unwrap().unwrap();
        assert_eq!(stored.paid_fees, BigDecimal::from(2000));
        assert!(!stored.is_request_sent);
        let ledger = state.list_transactions(&owner, None).await.unwrap();
        assert_eq!(ledger.len(), 1);
        assert_eq!(ledger[0].student_id, student.id);
    }

    #[tokio::test]
    async fn concurrent_payments_have_one_winner() {
        let state = manager();
        let student = state.create_student(payload("Rahul", "12", 5000)).await.unwrap();
        let request = state.create_fee_request(fee_request(&student, 2000)).await.unwrap();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let state = state.clone();
                let body = pay(&request, "UPI");
                tokio::spawn(async move { state.pay_fee_request(&admin(), body).await })
            })
            .collect();
        let mut paid = 0;
        for handle in handles {
            if handle.await.unwrap().is_ok() {
                paid += 1;
            }
        }
        assert_eq!(paid, 1);
        let stored = state.store.get_student(student.id).await.unwrap().unwrap();
        assert_eq!(stored.paid_fees, BigDecimal::from(2000));
    }

    #[tokio::test]
    async fn students_cannot_pay_for_others() {
        let state = manager();
        let student = state.create_student(payload("Rahul", "12", 5000)).await.unwrap();
        let request = state.create_fee_request(fee_request(&student, 2000)).await.unwrap();
        let other = LoggedUser { user_id: Uuid::new_v4(), role: Role::Student, expire_ts: 0 };

        let err = state.pay_fee_request(&other, pay(&request, "UPI")).await.unwrap_err();
        assert!(matches!(err, AppError::Forbidden(_)));
        let err = state.list_transactions(&other, Some(&student.id.to_string())).await.unwrap_err();
        assert!(matches!(err, AppError::Forbidden(_)));
    }

    #[tokio::test]
    async fn bank_transfer_needs_reference() {
        let state = manager();
        let student = state.create_student(payload("Rahul", "12", 5000)).await.unwrap();
        let request = state.create_fee_request(fee_request(&student, 2000)).await.unwrap();

        let err = state.pay_fee_request(&admin(), pay(&request, "Bank")).await.unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));

        let mut body = pay(&request, "Bank");
        body.proof.transaction_id = Some("UTR42".to_string());
        let tx = state.pay_fee_request(&admin(), body).await.unwrap();
        assert_eq!(tx.payment_proof.and_then(|p| p.transaction_id).as_deref(), Some("UTR42"));
    }

    #[tokio::test]
    async fn student_login_ignores_name_case() {
        let state = manager();
        state.create_student(payload("Rahul", "12", 5000)).await.unwrap();
        let login = |name: &str, roll: &str| StudentLoginRequest {
            name: Some(name.to_string()),
            roll_no: Some(roll.to_string()),
            class_name: Some("8A".to_string()),
        };

        let (student, token) = state.student_login(login("rahul", "12")).await.unwrap();
        assert_eq!(student.name, "Rahul");
        let session = state.keys.verify(&token).unwrap();
        assert_eq!(session.user_id, student.id);
        assert_eq!(session.role, Role::Student);

        let err = state.student_login(login("Rahul", "13")).await.unwrap_err();
        assert!(matches!(err, AppError::Unauthorized(_)));
    }

    #[tokio::test]
    async fn registration_bootstraps_then_requires_admin() {
        let state = manager();
        let req = |email: &str| RegisterRequest {
            name: "Office".to_string(),
            email: email.to_string(),
            password: "correct horse".to_string(),
        };

        let first = state.register(None, req("Office@School.test")).await.unwrap();
        assert_eq!(first.email, "office@school.test");

        let err = state.register(None, req("second@school.test")).await.unwrap_err();
        assert!(matches!(err, AppError::Forbidden(_)));

        let student = LoggedUser { user_id: Uuid::new_v4(), role: Role::Student, expire_ts: 0 };
        let err = state.register(Some(&student), req("second@school.test")).await.unwrap_err();
        assert!(matches!(err, AppError::Forbidden(_)));

        state.register(Some(&admin()), req("second@school.test")).await.unwrap();
        let err = state.register(Some(&admin()), req("OFFICE@school.test")).await.unwrap_err();
        assert!(matches!(err, AppError::DuplicateEmail(_)));
    }

    #[tokio::test]
    async fn concurrent_bootstrap_admits_one_admin() {
        for _ in 0..5 {
            let state = manager();
            let handles: Vec<_> = (0..4)
                .map(|i| {
                    let state = state.clone();
                    tokio::spawn(async move {
                        state
                            .register(None, RegisterRequest {
                                name: "Office".to_string(),
                                email: format!("office{}@school.test", i),
                                password: "correct horse".to_string(),
                            })
                            .await
                    })
                })
                .collect();
            let mut admitted = 0;
            for handle in handles {
                match handle.await.unwrap() {
                    Ok(_) => admitted += 1,
                    Err(e) => assert!(matches!(e, AppError::Forbidden(_))),
                }
            }
            assert_eq!(admitted, 1);
            assert_eq!(state.store.count_users().await.unwrap(), 1);
        }
    }

    #[tokio::test]
    async fn request_and_direct_payment_never_overpay() {
        let state = manager();
        let student = state.create_student(payload("Rahul", "12", 5000)).await.unwrap();
        let request = state.create_fee_request(fee_request(&student, 5000)).await.unwrap();

        let err = state
            .record_payment(RecordPaymentRequest {
                student_id: Some(student.id.to_string()),
                amount: Some(BigDecimal::from(5000)),
                payment_mode: Some("Cash".to_string()),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));

        state.pay_fee_request(&admin(), pay(&request, "UPI")).await.unwrap();
        let stored = state.store.get_student(student.id).await.unwrap().unwrap();
        assert_eq!(stored.paid_fees, BigDecimal::from(5000));
        assert_eq!(state.store.list_transactions(Some(student.id)).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn stale_request_flag_is_not_a_pending_request() {
        let state = manager();
        let mut student = Student::new(fields("1", 5000));
        student.is_request_sent = true;
        state.store.insert_student(&student).await.unwrap();
        assert!(state.pending_requests(&admin(), Some(&student.id.to_string())).await.unwrap().is_empty());

        state.create_fee_request(fee_request(&student, 1000)).await.unwrap();
        assert_eq!(
            state.pending_requests(&admin(), Some(&student.id.to_string())).await.unwrap().len(),
            1
        );

        let mut flagged = Student::new(fields("2", 3000));
        flagged.is_request_sent = true;
        state.store.insert_student(&flagged).await.unwrap();
        let report = state.bulk_send().await.unwrap();
        assert_eq!(report.sent, vec![flagged.id]);
        assert_eq!(report.skipped.len(), 1);
        assert_eq!(report.skipped[0].student_id, student.id);
    }

    #[tokio::test]
    async fn admin_login_failure_is_generic() {
        let state = manager();
        state
            .register(None, RegisterRequest {
                name: "Office".to_string(),
                email: "office@school.test".to_string(),
                password: "correct horse".to_string(),
            })
            .await
            .unwrap();

        let (user, token) = state.authenticate_admin(" OFFICE@school.test ", "correct horse").await.unwrap();
        assert_eq!(state.keys.verify(&token).unwrap().user_id, user.id);

        let wrong = state.authenticate_admin("office@school.test", "battery staple").await.unwrap_err();
        let unknown = state.authenticate_admin("nobody@school.test", "correct horse").await.unwrap_err();
        assert_eq!(wrong.to_string(), unknown.to_string());
        assert!(matches!(unknown, AppError::Unauthorized(_)));
    }

    /// Fails the first `failures` fee-request creations with a transient error.
    struct FlakyStore {
        inner: MemoryStore,
        failures: AtomicU32,
    }

    #[async_trait]
    impl FeeStore for FlakyStore {
        async fn count_users(&self) -> Result<usize> {
            self.inner.count_users().await
        }
        async fn insert_user(&self, user: &User, bootstrap: bool) -> Result<()> {
            self.inner.insert_user(user, bootstrap).await
        }
        async fn get_user_by_email(&self, email: &str) -> Result<Option<User>> {
            self.inner.get_user_by_email(email).await
        }
        async fn insert_student(&self, student: &Student) -> Result<()> {
            self.inner.insert_student(student).await
        }
        async fn update_student(&self, id: Uuid, fields: StudentFields) -> Result<Student> {
            self.inner.update_student(id, fields).await
        }
        async fn delete_student(&self, id: Uuid) -> Result<bool> {
            self.inner.delete_student(id).await
        }
        async fn get_student(&self, id: Uuid) -> Result<Option<Student>> {
            self.inner.get_student(id).await
        }
        async fn list_students(&self) -> Result<Vec<Student>> {
            self.inner.list_students().await
        }
        async fn find_students_by_roll(&self, roll_no: &str, class_name: &str) -> Result<Vec<Student>> {
            self.inner.find_students_by_roll(roll_no, class_name).await
        }
        async fn create_fee_request(&self, request: &FeeRequest) -> Result<()> {
            let left = self.failures.load(AtomicOrdering::SeqCst);
            if left > 0 {
                self.failures.store(left - 1, AtomicOrdering::SeqCst);
                return Err(AppError::Unavailable("write timeout".to_string()));
            }
            self.inner.create_fee_request(request).await
        }
        async fn get_fee_request(&self, id: Uuid) -> Result<Option<FeeRequest>> {
            self.inner.get_fee_request(id).await
        }
        async fn pending_fee_requests(&self, student_id: Uuid) -> Result<Vec<FeeRequest>> {
            self.inner.pending_fee_requests(student_id).await
        }
        async fn settle_fee_request(
            &self,
            id: Uuid,
            mode: PaymentMode,
            proof: Option<PaymentProof>,
            at: DateTime<Utc>,
        ) -> Result<FeeTransaction> {
            self.inner.settle_fee_request(id, mode, proof, at).await
        }
        async fn record_payment(&self, transaction: &FeeTransaction) -> Result<Student> {
            self.inner.record_payment(transaction).await
        }
        async fn list_transactions(&self, student_id: Option<Uuid>) -> Result<Vec<FeeTransaction>> {
            self.inner.list_transactions(student_id).await
        }
    }

    fn fields(roll_no: &str, total: i64) -> StudentFields {
        StudentFields {
            name: format!("Student {}", roll_no),
            roll_no: roll_no.to_string(),
            class_name: "8A".to_string(),
            session: "2024-25".to_string(),
            parent_name: String::new(),
            contact: String::new(),
            total_fees: BigDecimal::from(total),
        }
    }

    #[tokio::test]
    async fn bulk_send_reports_every_student() {
        let store = Arc::new(FlakyStore {
            inner: MemoryStore::new(),
            failures: AtomicU32::new(2),
        });
        let owing = Student::new(fields("1", 5000));
        let mut settled = Student::new(fields("2", 3000));
        settled.paid_fees = BigDecimal::from(3000);
        let pending = Student::new(fields("3", 4000));
        for s in [&owing, &settled, &pending] {
            store.insert_student(s).await.unwrap();
        }
        store
            .inner
            .create_fee_request(&FeeRequest::pending(&pending, BigDecimal::from(100)))
            .await
            .unwrap();

        let state = StoreStateManager::new(store.clone(), keys(), bulk());
        let report = state.bulk_send().await.unwrap();

        // Two transient failures, then success on the third attempt.
        assert_eq!(report.sent, vec![owing.id]);
        assert!(report.failed.is_empty());
        let skipped: Vec<Uuid> = report.skipped.iter().map(|s| s.student_id).collect();
        assert_eq!(skipped, vec![settled.id, pending.id]);

        let requests = store.pending_fee_requests(owing.id).await.unwrap();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].amount, BigDecimal::from(5000));
    }

    #[tokio::test]
    async fn bulk_send_gives_up_after_max_attempts() {
        let store = Arc::new(FlakyStore {
            inner: MemoryStore::new(),
            failures: AtomicU32::new(10),
        });
        let owing = Student::new(fields("1", 5000));
        store.insert_student(&owing).await.unwrap();

        let state = StoreStateManager::new(store, keys(), bulk());
        let report = state.bulk_send().await.unwrap();
        assert!(report.sent.is_empty());
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].student_id, owing.id);
        assert_eq!(report.failed[0].attempts, 3);
    }
}

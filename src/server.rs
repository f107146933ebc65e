use actix_web::web;

use crate::error::AppError;

/// Registers every route plus the body/query error handlers, so malformed
/// input comes back in the same `{success, message}` shape as other errors.
pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.app_data(web::JsonConfig::default().error_handler(|err, _req| {
        AppError::Validation(format!("Invalid request body: {}", err)).into()
    }))
    .app_data(web::QueryConfig::default().error_handler(|err, _req| {
        AppError::Validation(format!("Invalid query string: {}", err)).into()
    }))
    .service(handlers::health)
    .service(handlers::admin_login)
    .service(handlers::logout)
    .service(handlers::register)
    .service(handlers::student_login)
    .service(handlers::list_students)
    .service(handlers::create_student)
    .service(handlers::update_student)
    .service(handlers::delete_student)
    .service(handlers::bulk_send)
    .service(handlers::pay_fee_request)
    .service(handlers::pending_fee_requests)
    .service(handlers::create_fee_request)
    .service(handlers::list_fees)
    .service(handlers::record_payment);
}

pub mod handlers {
    use actix_web::{delete, get, post, put, web, HttpResponse};
    use std::sync::Arc;

    use crate::api::{
        CreateFeeRequest, CreateFeeRequestResponse, DeleteResponse, IdQuery, LoginRequest, LoginResponse,
        PayFeeRequest, PayFeeResponse, RecordPaymentRequest, RecordPaymentResponse, RegisterRequest,
        RegisterResponse, StudentIdQuery, StudentLoginRequest, StudentLoginResponse, StudentPayload,
        StudentResponse,
    };
    use crate::auth::{AdminUser, LoggedUser};
    use crate::state::StoreStateManager;

    #[get("/health")]
    pub async fn health() -> HttpResponse {
        HttpResponse::Ok().json(serde_json::json!({ "status": "ok" }))
    }

    #[post("/auth")]
    pub async fn admin_login(
        state_manager: web::Data<Arc<StoreStateManager>>,
        request: web::Json<LoginRequest>,
    ) -> Result<HttpResponse, actix_web::Error> {
        let login_req = request.into_inner();
        let (user, token) = state_manager
            .authenticate_admin(&login_req.email, &login_req.password)
            .await?;
        tracing::info!("Admin {} logged in", user.id);

        Ok(HttpResponse::Ok()
            .cookie(state_manager.keys.session_cookie(token.clone()))
            .json(LoginResponse {
                success: true,
                token,
                user_id: user.id,
                role: user.role,
            }))
    }

    // Tokens are not tracked server-side; dropping the cookie is all there is.
    #[post("/auth/logout")]
    pub async fn logout(state_manager: web::Data<Arc<StoreStateManager>>) -> HttpResponse {
        HttpResponse::Ok()
            .cookie(state_manager.keys.removal_cookie())
            .json(serde_json::json!({ "success": true }))
    }

    #[post("/register")]
    pub async fn register(
        state_manager: web::Data<Arc<StoreStateManager>>,
        caller: Option<LoggedUser>,
        request: web::Json<RegisterRequest>,
    ) -> Result<HttpResponse, actix_web::Error> {
        let user = state_manager.register(caller.as_ref(), request.into_inner()).await?;
        Ok(HttpResponse::Created().json(RegisterResponse {
            success: true,
            message: "User registered successfully".to_string(),
            user_id: user.id,
        }))
    }

    #[post("/students/login")]
    pub async fn student_login(
        state_manager: web::Data<Arc<StoreStateManager>>,
        request: web::Json<StudentLoginRequest>,
    ) -> Result<HttpResponse, actix_web::Error> {
        let (student, token) = state_manager.student_login(request.into_inner()).await?;
        tracing::info!("Student {} logged in", student.id);
        Ok(HttpResponse::Ok()
            .cookie(state_manager.keys.session_cookie(token))
            .json(StudentLoginResponse {
                success: true,
                student: student.public_view(),
            }))
    }

    #[get("/students")]
    pub async fn list_students(
        state_manager: web::Data<Arc<StoreStateManager>>,
        _admin: AdminUser,
    ) -> Result<HttpResponse, actix_web::Error> {
        let students = state_manager.list_students().await?;
        Ok(HttpResponse::Ok().json(students))
    }

    #[post("/students")]
    pub async fn create_student(
        state_manager: web::Data<Arc<StoreStateManager>>,
        _admin: AdminUser,
        payload: web::Json<StudentPayload>,
    ) -> Result<HttpResponse, actix_web::Error> {
        let student = state_manager.create_student(payload.into_inner()).await?;
        Ok(HttpResponse::Created().json(StudentResponse {
            success: true,
            message: "Student added successfully".to_string(),
            student,
        }))
    }

    #[put("/students")]
    pub async fn update_student(
        state_manager: web::Data<Arc<StoreStateManager>>,
        _admin: AdminUser,
        payload: web::Json<StudentPayload>,
    ) -> Result<HttpResponse, actix_web::Error> {
        let student = state_manager.update_student(payload.into_inner()).await?;
        Ok(HttpResponse::Ok().json(StudentResponse {
            success: true,
            message: "Student updated successfully".to_string(),
            student,
        }))
    }

    #[delete("/students")]
    pub async fn delete_student(
        state_manager: web::Data<Arc<StoreStateManager>>,
        _admin: AdminUser,
        query: web::Query<IdQuery>,
    ) -> Result<HttpResponse, actix_web::Error> {
        state_manager.delete_student(query.id.as_deref()).await?;
        Ok(HttpResponse::Ok().json(DeleteResponse {
            ok: true,
            message: "Student deleted".to_string(),
        }))
    }

    #[get("/fee-request")]
    pub async fn pending_fee_requests(
        state_manager: web::Data<Arc<StoreStateManager>>,
        user: LoggedUser,
        query: web::Query<StudentIdQuery>,
    ) -> Result<HttpResponse, actix_web::Error> {
        let requests = state_manager
            .pending_requests(&user, query.student_id.as_deref())
            .await?;
        Ok(HttpResponse::Ok().json(requests))
    }

    #[post("/fee-request")]
    pub async fn create_fee_request(
        state_manager: web::Data<Arc<StoreStateManager>>,
        _admin: AdminUser,
        request: web::Json<CreateFeeRequest>,
    ) -> Result<HttpResponse, actix_web::Error> {
        let request = state_manager.create_fee_request(request.into_inner()).await?;
        Ok(HttpResponse::Ok().json(CreateFeeRequestResponse {
            success: true,
            message: "Fee request sent".to_string(),
            request,
        }))
    }

    #[post("/fee-request/pay")]
    pub async fn pay_fee_request(
        state_manager: web::Data<Arc<StoreStateManager>>,
        user: LoggedUser,
        request: web::Json<PayFeeRequest>,
    ) -> Result<HttpResponse, actix_web::Error> {
        let transaction = state_manager.pay_fee_request(&user, request.into_inner()).await?;
        Ok(HttpResponse::Ok().json(PayFeeResponse {
            success: true,
            transaction,
        }))
    }

    #[post("/fee-request/bulk")]
    pub async fn bulk_send(
        state_manager: web::Data<Arc<StoreStateManager>>,
        admin: AdminUser,
    ) -> Result<HttpResponse, actix_web::Error> {
        tracing::info!("Bulk fee request send started by {}", admin.0.user_id);
        let report = state_manager.bulk_send().await?;
        Ok(HttpResponse::Ok().json(report))
    }

    #[get("/fees")]
    pub async fn list_fees(
        state_manager: web::Data<Arc<StoreStateManager>>,
        user: LoggedUser,
        query: web::Query<StudentIdQuery>,
    ) -> Result<HttpResponse, actix_web::Error> {
        let transactions = state_manager
            .list_transactions(&user, query.student_id.as_deref())
            .await?;
        Ok(HttpResponse::Ok().json(transactions))
    }

    #[post("/fees")]
    pub async fn record_payment(
        state_manager: web::Data<Arc<StoreStateManager>>,
        _admin: AdminUser,
        request: web::Json<RecordPaymentRequest>,
    ) -> Result<HttpResponse, actix_web::Error> {
        let transaction = state_manager.record_payment(request.into_inner()).await?;
        Ok(HttpResponse::Created().json(RecordPaymentResponse {
            success: true,
            message: "Payment recorded".to_string(),
            transaction,
        }))
    }
}

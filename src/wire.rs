use std::fmt::Debug;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::Sink;
use futures::stream;
use pgwire::api::auth::cleartext::CleartextPasswordAuthStartupHandler;
use pgwire::api::auth::{DefaultServerParameterProvider, StartupHandler};
use pgwire::api::copy::CopyHandler;
use pgwire::api::portal::{Format, Portal};
use pgwire::api::query::{ExtendedQueryHandler, SimpleQueryHandler};
use pgwire::api::results::{
    DataRowEncoder, DescribePortalResponse, DescribeStatementResponse, FieldFormat, FieldInfo,
    QueryResponse, Response, Tag,
};
use pgwire::api::stmt::{QueryParser, StoredStatement};
use pgwire::api::store::PortalStore;
use pgwire::api::{ClientInfo, ClientPortalStore, NoopHandler, PgWireServerHandlers, Type};
use pgwire::error::{ErrorInfo, PgWireError, PgWireResult};
use pgwire::messages::PgWireBackendMessage;
use pgwire::tokio::TlsAcceptor;
use tokio::net::TcpStream;

use crate::auth::SlotkeeperAuthSource;
use crate::engine::{BookingRequest, Engine, EngineError, now_ms};
use crate::model::*;
use crate::observability::{QUERIES_TOTAL, QUERY_DURATION_SECONDS, command_label};
use crate::sql::{self, Command, StatusChange};
use crate::tenant::TenantManager;

pub struct SlotkeeperHandler {
    tenant_manager: Arc<TenantManager>,
    query_parser: Arc<SlotkeeperQueryParser>,
}

impl SlotkeeperHandler {
    pub fn new(tenant_manager: Arc<TenantManager>) -> Self {
        Self {
            tenant_manager,
            query_parser: Arc::new(SlotkeeperQueryParser),
        }
    }

    fn resolve_engine<C: ClientInfo>(&self, client: &C) -> PgWireResult<Arc<Engine>> {
        let db = client
            .metadata()
            .get("database")
            .cloned()
            .unwrap_or_else(|| "default".to_string());
        self.tenant_manager.get_or_create(&db).map_err(|e| {
            tracing::warn!(tenant = %db, error = %e, "tenant unavailable");
            user_error("08006", format!("tenant error: {e}"))
        })
    }

    /// Parse, execute and record RED metrics for one statement.
    async fn run(&self, engine: &Engine, query: &str) -> PgWireResult<Vec<Response>> {
        let cmd = sql::parse_sql(query).map_err(sql_err)?;
        let label = command_label(&cmd);
        let started = Instant::now();
        let result = self.execute_command(engine, cmd).await;
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(QUERIES_TOTAL, "command" => label, "status" => status).increment(1);
        metrics::histogram!(QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        result
    }

    async fn execute_command(&self, engine: &Engine, cmd: Command) -> PgWireResult<Vec<Response>> {
        match cmd {
            Command::InsertProfessional { id, email, name } => {
                engine
                    .create_professional(id, email, name)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![insert_tag()])
            }
            Command::InsertWorkingHours {
                professional_id,
                weekday,
                window,
            } => {
                engine
                    .add_working_window(professional_id, weekday, window)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![insert_tag()])
            }
            Command::DeleteWorkingHours {
                professional_id,
                weekday,
            } => {
                engine
                    .clear_working_day(professional_id, weekday)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("DELETE").with_rows(1))])
            }
            Command::InsertService { service } => {
                engine.create_service(service).await.map_err(engine_err)?;
                Ok(vec![insert_tag()])
            }
            Command::InsertBlock {
                id,
                professional_id,
                kind,
                reason,
            } => {
                engine
                    .add_block(professional_id, id, kind, reason)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![insert_tag()])
            }
            Command::DeleteBlock { id } => {
                engine.deactivate_block(id).await.map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("DELETE").with_rows(1))])
            }
            Command::SelectBlocks { professional_id } => {
                let blocks = engine
                    .list_blocks(professional_id)
                    .await
                    .map_err(engine_err)?;
                let schema = Arc::new(blocks_schema());
                let rows: Vec<PgWireResult<_>> = blocks
                    .iter()
                    .map(|block| encode_block(&schema, block))
                    .collect();
                Ok(vec![query_response(schema, rows)])
            }
            Command::SelectAvailability {
                professional_id,
                service_id,
                date,
                step_ms,
            } => {
                let day = engine
                    .availability(professional_id, service_id, date, step_ms)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![slots_response(day)])
            }
            Command::SelectSuggestions {
                professional_id,
                service_id,
                date,
                preferred,
                max,
            } => {
                let day = engine
                    .suggestions(professional_id, service_id, date, preferred, max)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![slots_response(day)])
            }
            Command::InsertBooking {
                professional_id,
                service_id,
                staff_id,
                start,
                client_name,
                client_email,
            } => {
                let receipt = engine
                    .book(BookingRequest {
                        professional_id,
                        service_id,
                        staff_id,
                        start,
                        client_name,
                        client_email,
                    })
                    .await
                    .map_err(engine_err)?;
                let schema = Arc::new(receipt_schema());
                let mut encoder = DataRowEncoder::new(schema.clone());
                encoder.encode_field(&receipt.id.to_string())?;
                encoder.encode_field(&rfc3339(receipt.span.start))?;
                encoder.encode_field(&rfc3339(receipt.span.end))?;
                encoder.encode_field(&receipt.cancellation_url)?;
                encoder.encode_field(&receipt.calendar_synced)?;
                Ok(vec![query_response(schema, vec![Ok(encoder.take_row())])])
            }
            Command::SelectBookingByToken { token } => {
                let summary = engine.booking_by_token(&token).await.map_err(engine_err)?;
                let schema = Arc::new(summary_schema());
                let mut encoder = DataRowEncoder::new(schema.clone());
                encoder.encode_field(&summary.id.to_string())?;
                encoder.encode_field(&summary.client_name)?;
                encoder.encode_field(&summary.client_email)?;
                encoder.encode_field(&summary.service_name)?;
                encoder.encode_field(&summary.professional_name)?;
                encoder.encode_field(&rfc3339(summary.span.start))?;
                encoder.encode_field(&rfc3339(summary.span.end))?;
                encoder.encode_field(&summary.status.to_string())?;
                Ok(vec![query_response(schema, vec![Ok(encoder.take_row())])])
            }
            Command::CancelByToken { token, reason } => {
                engine
                    .cancel_by_token(&token, reason)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("UPDATE").with_rows(1))])
            }
            Command::UpdateBookingStatus {
                id,
                professional_id,
                change,
                reason,
            } => {
                match change {
                    StatusChange::Cancel => engine
                        .cancel_by_professional(professional_id, id, reason)
                        .await
                        .map_err(engine_err)?,
                    StatusChange::Close(outcome) => engine
                        .close_reservation(professional_id, id, outcome)
                        .await
                        .map_err(engine_err)?,
                };
                Ok(vec![Response::Execution(Tag::new("UPDATE").with_rows(1))])
            }
            Command::SelectBookings {
                professional_id,
                filter,
            } => {
                let reservations = engine
                    .list_reservations(professional_id, &filter)
                    .await
                    .map_err(engine_err)?;
                let schema = Arc::new(reservations_schema());
                let rows: Vec<PgWireResult<_>> = reservations
                    .iter()
                    .map(|r| encode_reservation(&schema, r))
                    .collect();
                Ok(vec![query_response(schema, rows)])
            }
            Command::SelectBookingStats { professional_id } => {
                let stats = engine
                    .booking_stats(professional_id, now_ms())
                    .await
                    .map_err(engine_err)?;
                let schema = Arc::new(stats_schema());
                let mut encoder = DataRowEncoder::new(schema.clone());
                encoder.encode_field(&(stats.total_confirmed as i64))?;
                encoder.encode_field(&(stats.upcoming as i64))?;
                encoder.encode_field(&(stats.this_month as i64))?;
                encoder.encode_field(&(stats.cancelled as i64))?;
                encoder.encode_field(&stats.monthly_revenue_cents)?;
                Ok(vec![query_response(schema, vec![Ok(encoder.take_row())])])
            }
        }
    }
}

fn insert_tag() -> Response {
    Response::Execution(Tag::new("INSERT").with_rows(1))
}

fn query_response(
    schema: Arc<Vec<FieldInfo>>,
    rows: Vec<PgWireResult<pgwire::messages::data::DataRow>>,
) -> Response {
    Response::Query(QueryResponse::new(schema, stream::iter(rows)))
}

fn slots_response(day: DayAvailability) -> Response {
    let schema = Arc::new(slots_schema());
    let rows: Vec<PgWireResult<_>> = day
        .slots
        .iter()
        .map(|slot| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&slot.to_string())?;
            encoder.encode_field(&day.degraded)?;
            Ok(encoder.take_row())
        })
        .collect();
    query_response(schema, rows)
}

fn encode_block(
    schema: &Arc<Vec<FieldInfo>>,
    block: &Block,
) -> PgWireResult<pgwire::messages::data::DataRow> {
    let (date, start, end, weekday) = match &block.kind {
        BlockKind::FullDay { date } => (Some(date.to_string()), None, None, None),
        BlockKind::TimeSlot { span } => (
            None,
            Some(rfc3339(span.start)),
            Some(rfc3339(span.end)),
            None,
        ),
        BlockKind::Recurring { weekday, window } => (
            None,
            Some(window.start.to_string()),
            Some(window.end.to_string()),
            Some(weekday_name(*weekday).to_string()),
        ),
    };
    let mut encoder = DataRowEncoder::new(schema.clone());
    encoder.encode_field(&block.id.to_string())?;
    encoder.encode_field(&block.kind.label().to_string())?;
    encoder.encode_field(&date)?;
    encoder.encode_field(&start)?;
    encoder.encode_field(&end)?;
    encoder.encode_field(&weekday)?;
    encoder.encode_field(&block.reason)?;
    Ok(encoder.take_row())
}

fn encode_reservation(
    schema: &Arc<Vec<FieldInfo>>,
    r: &Reservation,
) -> PgWireResult<pgwire::messages::data::DataRow> {
    let mut encoder = DataRowEncoder::new(schema.clone());
    encoder.encode_field(&r.id.to_string())?;
    encoder.encode_field(&r.service_id.to_string())?;
    encoder.encode_field(&r.staff_id.map(|s| s.to_string()))?;
    encoder.encode_field(&r.client_name)?;
    encoder.encode_field(&r.client_email)?;
    encoder.encode_field(&rfc3339(r.span.start))?;
    encoder.encode_field(&rfc3339(r.span.end))?;
    encoder.encode_field(&r.status.label().to_string())?;
    encoder.encode_field(&r.external_event_id)?;
    encoder.encode_field(&r.cancelled_at().map(rfc3339))?;
    encoder.encode_field(&r.cancellation_reason().map(str::to_string))?;
    Ok(encoder.take_row())
}

// ── Result schemas ───────────────────────────────────────────────

fn text_field(name: &str) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, Type::VARCHAR, FieldFormat::Text)
}

fn typed_field(name: &str, ty: Type) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, ty, FieldFormat::Text)
}

fn slots_schema() -> Vec<FieldInfo> {
    vec![text_field("slot"), typed_field("degraded", Type::BOOL)]
}

fn receipt_schema() -> Vec<FieldInfo> {
    vec![
        text_field("id"),
        text_field("start"),
        text_field("end"),
        text_field("cancellation_url"),
        typed_field("calendar_synced", Type::BOOL),
    ]
}

fn summary_schema() -> Vec<FieldInfo> {
    [
        "id",
        "client_name",
        "client_email",
        "service_name",
        "professional_name",
        "start",
        "end",
        "status",
    ]
    .into_iter()
    .map(text_field)
    .collect()
}

fn reservations_schema() -> Vec<FieldInfo> {
    [
        "id",
        "service_id",
        "staff_id",
        "client_name",
        "client_email",
        "start",
        "end",
        "status",
        "external_event_id",
        "cancelled_at",
        "cancellation_reason",
    ]
    .into_iter()
    .map(text_field)
    .collect()
}

fn stats_schema() -> Vec<FieldInfo> {
    [
        "total_confirmed",
        "upcoming",
        "this_month",
        "cancelled",
        "monthly_revenue_cents",
    ]
    .into_iter()
    .map(|name| typed_field(name, Type::INT8))
    .collect()
}

fn blocks_schema() -> Vec<FieldInfo> {
    ["id", "kind", "date", "start", "end", "weekday", "reason"]
        .into_iter()
        .map(text_field)
        .collect()
}

/// Row shape of a statement, judged from its text alone. Used by Describe,
/// where `$n` placeholders are still unbound.
fn result_schema(sql: &str) -> Vec<FieldInfo> {
    let normalized = sql
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_uppercase();
    let is_select = normalized.starts_with("SELECT");
    if normalized.starts_with("INSERT INTO BOOKINGS") {
        receipt_schema()
    } else if !is_select {
        vec![]
    } else if normalized.contains("FROM AVAILABILITY") || normalized.contains("FROM SUGGESTIONS")
    {
        slots_schema()
    } else if normalized.contains("FROM BOOKING_STATS") {
        stats_schema()
    } else if normalized.contains("FROM BLOCKS") {
        blocks_schema()
    } else if normalized.contains("FROM BOOKINGS") && normalized.contains("TOKEN") {
        summary_schema()
    } else if normalized.contains("FROM BOOKINGS") {
        reservations_schema()
    } else {
        vec![]
    }
}

#[async_trait]
impl SimpleQueryHandler for SlotkeeperHandler {
    async fn do_query<C>(&self, client: &mut C, query: &str) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let engine = self.resolve_engine(client)?;
        self.run(&engine, query).await
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct SlotkeeperQueryParser;

#[async_trait]
impl QueryParser for SlotkeeperQueryParser {
    type Statement = String;

    async fn parse_sql<C>(
        &self,
        _client: &C,
        sql: &str,
        _types: &[Option<Type>],
    ) -> PgWireResult<String>
    where
        C: ClientInfo + Unpin + Send + Sync,
    {
        Ok(sql.to_string())
    }

    fn get_parameter_types(&self, stmt: &String) -> PgWireResult<Vec<Type>> {
        Ok(vec![Type::VARCHAR; count_params(stmt)])
    }

    fn get_result_schema(
        &self,
        stmt: &String,
        _column_format: Option<&Format>,
    ) -> PgWireResult<Vec<FieldInfo>> {
        Ok(result_schema(stmt))
    }
}

#[async_trait]
impl ExtendedQueryHandler for SlotkeeperHandler {
    type Statement = String;
    type QueryParser = SlotkeeperQueryParser;

    fn query_parser(&self) -> Arc<Self::QueryParser> {
        self.query_parser.clone()
    }

    async fn do_query<C>(
        &self,
        client: &mut C,
        portal: &Portal<Self::Statement>,
        _max_rows: usize,
    ) -> PgWireResult<Response>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let engine = self.resolve_engine(client)?;
        let sql = substitute_params(portal);
        self.run(&engine, &sql)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| user_error("XX000", "statement produced no response".into()))
    }

    async fn do_describe_statement<C>(
        &self,
        _client: &mut C,
        target: &StoredStatement<Self::Statement>,
    ) -> PgWireResult<DescribeStatementResponse>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let param_types = vec![Type::VARCHAR; count_params(&target.statement)];
        Ok(DescribeStatementResponse::new(
            param_types,
            result_schema(&target.statement),
        ))
    }

    async fn do_describe_portal<C>(
        &self,
        _client: &mut C,
        target: &Portal<Self::Statement>,
    ) -> PgWireResult<DescribePortalResponse>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        Ok(DescribePortalResponse::new(result_schema(
            &target.statement.statement,
        )))
    }
}

/// Highest `$N` placeholder in the SQL string.
fn count_params(sql: &str) -> usize {
    let bytes = sql.as_bytes();
    let mut max = 0usize;
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] != b'$' {
            i += 1;
            continue;
        }
        i += 1;
        let start = i;
        while i < bytes.len() && bytes[i].is_ascii_digit() {
            i += 1;
        }
        if let Ok(n) = sql[start..i].parse::<usize>() {
            max = max.max(n);
        }
    }
    max
}

/// Inline bound parameters (text format) as quoted literals. Highest index
/// first so `$1` never clobbers `$10`.
fn substitute_params(portal: &Portal<String>) -> String {
    let mut sql = portal.statement.statement.to_string();
    for (i, param) in portal.parameters.iter().enumerate().rev() {
        let value = match param {
            Some(bytes) => format!("'{}'", String::from_utf8_lossy(bytes).replace('\'', "''")),
            None => "NULL".to_string(),
        };
        sql = sql.replace(&format!("${}", i + 1), &value);
    }
    sql
}

// ── Factory ──────────────────────────────────────────────────────

pub struct SlotkeeperFactory {
    handler: Arc<SlotkeeperHandler>,
    auth_handler: Arc<
        CleartextPasswordAuthStartupHandler<SlotkeeperAuthSource, DefaultServerParameterProvider>,
    >,
    noop: Arc<NoopHandler>,
}

impl SlotkeeperFactory {
    pub fn new(tenant_manager: Arc<TenantManager>, password: String) -> Self {
        Self {
            handler: Arc::new(SlotkeeperHandler::new(tenant_manager)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                SlotkeeperAuthSource::new(password),
                DefaultServerParameterProvider::default(),
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for SlotkeeperFactory {
    fn simple_query_handler(&self) -> Arc<impl SimpleQueryHandler> {
        self.handler.clone()
    }

    fn extended_query_handler(&self) -> Arc<impl ExtendedQueryHandler> {
        self.handler.clone()
    }

    fn startup_handler(&self) -> Arc<impl StartupHandler> {
        self.auth_handler.clone()
    }

    fn copy_handler(&self) -> Arc<impl CopyHandler> {
        self.noop.clone()
    }
}

/// Serve one client socket until it disconnects.
pub async fn process_connection(
    socket: TcpStream,
    tenant_manager: Arc<TenantManager>,
    password: String,
    tls: Option<TlsAcceptor>,
) -> std::io::Result<()> {
    let factory = SlotkeeperFactory::new(tenant_manager, password);
    pgwire::tokio::process_socket(socket, tls, factory).await
}

// ── Error mapping ────────────────────────────────────────────────

fn user_error(code: &str, message: String) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        code.into(),
        message,
    )))
}

fn sqlstate(e: &EngineError) -> &'static str {
    match e {
        EngineError::Validation(_) => "22023",
        EngineError::NotFound(..) => "P0002",
        EngineError::AlreadyExists(_) => "23505",
        EngineError::SlotTaken(_) => "23P01",
        EngineError::AlreadyCancelled | EngineError::InvalidTransition(_) => "55000",
        EngineError::TooLate { .. } => "P0001",
        EngineError::CalendarUnavailable(_) => "57P03",
        EngineError::LimitExceeded(_) => "54000",
        EngineError::Persistence(_) => "58030",
    }
}

/// Infrastructure detail goes to the log, not to the client.
fn client_message(e: &EngineError) -> String {
    match e {
        EngineError::Persistence(detail) => {
            tracing::error!(error = %detail, "persistence failure");
            "internal storage error".to_string()
        }
        other => other.to_string(),
    }
}

fn engine_err(e: EngineError) -> PgWireError {
    user_error(sqlstate(&e), client_message(&e))
}

fn sql_err(e: sql::SqlError) -> PgWireError {
    user_error("42601", e.to_string())
}

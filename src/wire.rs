use std::fmt::Debug;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::stream;
use futures::Sink;
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
use ulid::Ulid;

use crate::auth::ClinicAuthSource;
use crate::engine::*;
use crate::model::AppointmentStatus;
use crate::observability::{command_label, QUERIES_TOTAL, QUERY_DURATION_SECONDS};
use crate::sql::{self, Command, CompareOp, Filter, Literal, SqlError};
use crate::table::{self, Cell, Kind, Table, Tabular};
use crate::tenant::TenantManager;

pub struct ClinicHandler {
    tenant_manager: Arc<TenantManager>,
    query_parser: Arc<ClinicQueryParser>,
}

/// Run one command against a repository handle. A macro rather than a
/// generic fn so the handle's futures stay concrete (and therefore `Send`).
macro_rules! run_on {
    ($repo:expr, $cmd:expr) => {{
        let repo = $repo;
        match $cmd {
            Command::Insert { table, rows, returning } => {
                let mut created = Vec::with_capacity(rows.len());
                for row in &rows {
                    let fields = table::decode_fields(row).map_err(sql_err)?;
                    created.push(repo.create(fields).await.map_err(engine_err)?);
                }
                if returning {
                    row_response(table, &all_columns(table), created.iter().map(Tabular::cells))
                } else {
                    Ok(Response::Execution(Tag::new("INSERT").with_rows(created.len())))
                }
            }
            Command::Update { table, id, assignments, returning } => {
                let fields = table::decode_fields(&assignments).map_err(sql_err)?;
                let updated = repo.update(id, fields).await.map_err(engine_err)?;
                if returning {
                    row_response(table, &all_columns(table), std::iter::once(updated.cells()))
                } else {
                    Ok(Response::Execution(Tag::new("UPDATE").with_rows(1)))
                }
            }
            Command::Delete { id, .. } => {
                repo.delete(id).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
            }
            Command::Select { table, projection, filters } => {
                let records = repo.list().await;
                select_response(table, &projection, &filters, records.iter().map(Tabular::cells))
            }
        }
    }};
}

impl ClinicHandler {
    pub fn new(tenant_manager: Arc<TenantManager>) -> Self {
        Self {
            tenant_manager,
            query_parser: Arc::new(ClinicQueryParser),
        }
    }

    fn resolve_engine<C: ClientInfo>(&self, client: &C) -> PgWireResult<Arc<Engine>> {
        let db = client
            .metadata()
            .get("database")
            .cloned()
            .unwrap_or_else(|| "default".to_string());
        self.tenant_manager
            .get_or_create(&db)
            .map_err(|e| user_error("08006", format!("clinic error: {e}")))
    }

    /// Execute one command, recording its RED metrics.
    async fn execute(&self, engine: &Engine, cmd: Command) -> PgWireResult<Response> {
        let label = command_label(&cmd);
        let table = cmd.table().name();
        let started = Instant::now();
        let result = self.execute_command(engine, cmd).await;
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(QUERIES_TOTAL, "command" => label, "table" => table, "status" => status)
            .increment(1);
        metrics::histogram!(QUERY_DURATION_SECONDS, "command" => label, "table" => table)
            .record(started.elapsed().as_secs_f64());
        result
    }

    async fn execute_command(&self, engine: &Engine, cmd: Command) -> PgWireResult<Response> {
        match cmd.table() {
            Table::Specialties => run_on!(Specialties(engine), cmd),
            Table::Doctors => run_on!(Doctors(engine), cmd),
            Table::Patients => run_on!(Patients(engine), cmd),
            Table::Histories => run_on!(Histories(engine), cmd),
            Table::Prescriptions => run_on!(Prescriptions(engine), cmd),
            Table::Reminders => run_on!(Reminders(engine), cmd),
            Table::Appointments => match cmd {
                // Equality filters narrow the scan to one agenda where possible.
                Command::Select { table, projection, filters } => {
                    let scope = appointment_scope(&filters);
                    let records = engine.list_appointments(&scope).await;
                    select_response(table, &projection, &filters, records.iter().map(Tabular::cells))
                }
                cmd => run_on!(Appointments(engine), cmd),
            },
        }
    }
}

/// The subset of `filters` the engine can apply while listing appointments.
fn appointment_scope(filters: &[Filter]) -> AppointmentFilter {
    let mut scope = AppointmentFilter::default();
    let columns = Table::Appointments.columns();
    for filter in filters {
        let (CompareOp::Eq, Literal::Text(value)) = (filter.op, &filter.value) else {
            continue;
        };
        match columns[filter.column].name {
            "doctor_id" => scope.doctor_id = Ulid::from_string(value.trim()).ok(),
            "patient_id" => scope.patient_id = Ulid::from_string(value.trim()).ok(),
            "status" => scope.status = value.parse::<AppointmentStatus>().ok(),
            _ => {}
        }
    }
    scope
}

fn all_columns(table: Table) -> Vec<usize> {
    (0..table.columns().len()).collect()
}

fn field_info(table: Table, column: usize) -> FieldInfo {
    let column = &table.columns()[column];
    let ty = match column.kind {
        Kind::Int => Type::INT8,
        Kind::Bool => Type::BOOL,
        _ => Type::VARCHAR,
    };
    FieldInfo::new(column.name.into(), None, None, ty, FieldFormat::Text)
}

fn schema(table: Table, projection: &[usize]) -> Vec<FieldInfo> {
    projection.iter().map(|&i| field_info(table, i)).collect()
}

fn select_response(
    table: Table,
    projection: &[usize],
    filters: &[Filter],
    rows: impl Iterator<Item = Vec<Cell>>,
) -> PgWireResult<Response> {
    let predicates = table::compile_filters(table, filters).map_err(sql_err)?;
    row_response(
        table,
        projection,
        rows.filter(|row| predicates.iter().all(|p| p.matches(row))),
    )
}

fn row_response(
    table: Table,
    projection: &[usize],
    rows: impl Iterator<Item = Vec<Cell>>,
) -> PgWireResult<Response> {
    let schema = Arc::new(schema(table, projection));
    let rows: Vec<PgWireResult<_>> = rows
        .map(|row| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            for &i in projection {
                match &row[i] {
                    Cell::Int(n) => encoder.encode_field(n)?,
                    Cell::Bool(b) => encoder.encode_field(b)?,
                    cell => encoder.encode_field(&cell.render())?,
                }
            }
            Ok(encoder.take_row())
        })
        .collect();

    Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
}

/// Result columns of a statement that may still carry `$n` placeholders.
fn describe_schema(sql: &str) -> Vec<FieldInfo> {
    match sql::describe(sql) {
        Ok(Some((table, projection))) => schema(table, &projection),
        _ => vec![],
    }
}

#[async_trait]
impl SimpleQueryHandler for ClinicHandler {
    async fn do_query<C>(
        &self,
        client: &mut C,
        query: &str,
    ) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let engine = self.resolve_engine(client)?;
        let commands = sql::parse_statements(query).map_err(sql_err)?;
        let mut responses = Vec::with_capacity(commands.len());
        for cmd in commands {
            responses.push(self.execute(&engine, cmd).await?);
        }
        Ok(responses)
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct ClinicQueryParser;

#[async_trait]
impl QueryParser for ClinicQueryParser {
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
        Ok(describe_schema(stmt))
    }
}

#[async_trait]
impl ExtendedQueryHandler for ClinicHandler {
    type Statement = String;
    type QueryParser = ClinicQueryParser;

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
        let cmd = sql::parse_sql(&sql).map_err(sql_err)?;
        self.execute(&engine, cmd).await
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
            describe_schema(&target.statement),
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
        Ok(DescribePortalResponse::new(describe_schema(
            &target.statement.statement,
        )))
    }
}

/// Count the highest $N parameter placeholder in the SQL string.
/// `$n` placeholders as `(byte range, n)`, outside quoted literals.
fn placeholders(sql: &str) -> Vec<(std::ops::Range<usize>, usize)> {
    let bytes = sql.as_bytes();
    let mut found = Vec::new();
    let mut quote: Option<u8> = None;
    let mut i = 0;
    while i < bytes.len() {
        let b = bytes[i];
        match quote {
            Some(q) if b == q => quote = None,
            Some(_) => {}
            None if b == b'\'' || b == b'"' => quote = Some(b),
            None if b == b'$' => {
                let start = i;
                i += 1;
                while i < bytes.len() && bytes[i].is_ascii_digit() {
                    i += 1;
                }
                if let Ok(n) = sql[start + 1..i].parse::<usize>() {
                    found.push((start..i, n));
                }
                continue;
            }
            None => {}
        }
        i += 1;
    }
    found
}

fn count_params(sql: &str) -> usize {
    placeholders(sql).into_iter().map(|(_, n)| n).max().unwrap_or(0)
}

/// Substitute $1, $2, ... with bound parameter values (text format).
fn substitute_params(portal: &Portal<String>) -> String {
    let params: Vec<Option<String>> = portal
        .parameters
        .iter()
        .map(|p| p.as_ref().map(|bytes| String::from_utf8_lossy(bytes).into_owned()))
        .collect();
    bind_params(&portal.statement.statement, &params)
}

/// One pass over the statement text, so a bound value is never rescanned.
fn bind_params(sql: &str, params: &[Option<String>]) -> String {
    let mut result = String::with_capacity(sql.len());
    let mut copied = 0;
    for (range, n) in placeholders(sql) {
        let Some(param) = n.checked_sub(1).and_then(|i| params.get(i)) else {
            continue;
        };
        result.push_str(&sql[copied..range.start]);
        match param {
            Some(text) => {
                result.push('\'');
                result.push_str(&text.replace('\'', "''"));
                result.push('\'');
            }
            None => result.push_str("NULL"),
        }
        copied = range.end;
    }
    result.push_str(&sql[copied..]);
    result
}

// ── Factory ──────────────────────────────────────────────────────

pub struct ClinicFactory {
    handler: Arc<ClinicHandler>,
    auth_handler:
        Arc<CleartextPasswordAuthStartupHandler<ClinicAuthSource, DefaultServerParameterProvider>>,
    noop: Arc<NoopHandler>,
}

impl ClinicFactory {
    pub fn new(tenant_manager: Arc<TenantManager>, password: String) -> Self {
        let auth_source = ClinicAuthSource::new(password);
        let param_provider = DefaultServerParameterProvider::default();
        Self {
            handler: Arc::new(ClinicHandler::new(tenant_manager)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                auth_source,
                param_provider,
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for ClinicFactory {
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

/// Serve one console connection until the client disconnects.
pub async fn process_connection(
    socket: TcpStream,
    tenant_manager: Arc<TenantManager>,
    password: String,
    tls: Option<TlsAcceptor>,
) -> std::io::Result<()> {
    let factory = Arc::new(ClinicFactory::new(tenant_manager, password));
    pgwire::tokio::process_socket(socket, tls, factory).await
}

// ── Errors ───────────────────────────────────────────────────────

fn user_error(code: &str, message: String) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        code.into(),
        message,
    )))
}

fn engine_sqlstate(e: &EngineError) -> &'static str {
    match e {
        EngineError::Overlap { .. } => "23P01",
        EngineError::AlreadyExists(..) => "23505",
        EngineError::NotFound(..) => "P0002",
        EngineError::Validation(_) => "22023",
        EngineError::LimitExceeded(_) => "54000",
        EngineError::WalError(_) => "58030",
    }
}

fn engine_err(e: EngineError) -> PgWireError {
    user_error(engine_sqlstate(&e), e.to_string())
}

fn sql_err(e: SqlError) -> PgWireError {
    user_error(e.sqlstate(), e.to_string())
}

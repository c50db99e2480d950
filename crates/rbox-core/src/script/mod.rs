//! Script builder
//!
//! Wraps caller R source in a harness that runs it with the workspace as the
//! working directory, sends output to a fixed location in the run directory,
//! always closes devices and sinks, and records the outcome in `marker.json`.
//! Caller code is written to its own file and parsed by the harness; it is
//! never spliced into harness text. Environment-specific paths reach the
//! harness through `RBOX_*` environment variables set by the backend.

pub mod marker;

pub use marker::{Marker, MarkerStatus, OutputStatus};

use crate::types::{ExecutionRequest, ImageFormat, ImageParams, OutputKind};

pub const SCRIPT_FILE: &str = "script.R";
pub const USER_CODE_FILE: &str = "user_code.R";
pub const MARKER_FILE: &str = "marker.json";
pub const TEXT_OUTPUT_FILE: &str = "output.txt";
pub const PACKAGE_LIST_FILE: &str = "packages.tsv";
pub const EXCEL_DETAILS_FILE: &str = "excel.tsv";

pub fn image_output_file(format: ImageFormat) -> String {
    format!("output.{}", format.extension())
}

/// A harness ready to be copied into an environment's run directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WrappedScript {
    pub harness: String,
    pub user_code: Option<String>,
    /// Run-directory file holding the primary output, if any
    pub primary_output: Option<String>,
}

/// Quote `value` as an R string literal.
pub fn r_string(value: &str) -> String {
    let mut out = String::with_capacity(value.len() + 2);
    out.push('"');
    for c in value.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            // R strings cannot hold NUL
            '\0' => {}
            c if c.is_ascii_control() => out.push_str(&format!("\\x{:02x}", c as u32)),
            c if !c.is_ascii() => out.push_str(&format!("\\U{{{:x}}}", c as u32)),
            c => out.push(c),
        }
    }
    out.push('"');
    out
}

fn r_vector(values: &[String]) -> String {
    let items: Vec<String> = values.iter().map(|v| r_string(v)).collect();
    format!("c({})", items.join(", "))
}

const PRELUDE: &str = r#"# Generated by rbox
options(warn = 1, encoding = "UTF-8")
local({
  run_dir <- Sys.getenv("RBOX_RUN_DIR", getwd())
  workspace <- Sys.getenv("RBOX_WORKSPACE", run_dir)
  writable <- Sys.getenv("RBOX_WRITABLE", workspace)
  library_dir <- Sys.getenv("RBOX_LIBRARY", "")
  if (nzchar(library_dir) && dir.exists(library_dir)) {
    .libPaths(c(library_dir, .libPaths()))
  }
  marker_path <- file.path(run_dir, "marker.json")
  user_code <- file.path(run_dir, "user_code.R")

  json_escape <- function(x) {
    x <- gsub("\\\\", "\\\\\\\\", x)
    x <- gsub("\"", "\\\\\"", x)
    x <- gsub("\n", "\\\\n", x)
    x <- gsub("\r", "\\\\r", x)
    x <- gsub("\t", "\\\\t", x)
    gsub("[[:cntrl:]]", " ", x)
  }

  write_marker <- function(status, msg, output) {
    msg <- paste(msg, collapse = "\n")
    if (isTRUE(nchar(msg, type = "chars", allowNA = TRUE) > max_message)) {
      msg <- paste0(substr(msg, 1, max_message), "... [truncated]")
    }
    json <- paste0('{"status": "', status, '", "message": "', json_escape(msg),
                   '", "output": "', output, '"}')
    writeLines(enc2utf8(json), marker_path, useBytes = TRUE)
  }

  eval_user <- function(path) {
    exprs <- parse(file = path, keep.source = FALSE, encoding = "UTF-8")
    plotted <- FALSE
    for (expr in exprs) {
      res <- withVisible(eval(expr, envir = globalenv()))
      if (res$visible) {
        print(res$value)
        if (inherits(res$value, c("ggplot", "trellis", "recordedplot"))) plotted <- TRUE
      }
    }
    plotted
  }

  assign("workspace_file", function(name) {
    for (dir in c(workspace, writable)) {
      candidate <- file.path(dir, name)
      if (file.exists(candidate)) return(normalizePath(candidate))
    }
    available <- unique(c(list.files(workspace), list.files(writable)))
    stem <- tolower(tools::file_path_sans_ext(basename(name)))
    similar <- available[grepl(stem, tolower(available), fixed = TRUE)]
    hint <- if (length(similar) > 0) {
      paste0(" (did you mean: ", paste(utils::head(similar, 5), collapse = ", "), "?)")
    } else ""
    stop(paste0("File not found: ", name, hint), call. = FALSE)
  }, envir = globalenv())

  status <- "ok"
  msg <- ""
  stage <- "harness"
  primary <- NULL
  fail <- function(e) {
    status <<- if (identical(stage, "caller")) "caller_error" else "harness_error"
    msg <<- conditionMessage(e)
  }
"#;

const EPILOGUE: &str = r#"
  output <- if (!is.null(primary) && file.exists(primary) &&
                isTRUE(file.info(primary)$size > 0)) "produced" else "none"
  write_marker(status, msg, output)
  quit(save = "no", status = switch(status, ok = 0L, caller_error = 1L, 2L))
})
"#;

const TEXT_BODY: &str = r#"
  primary <- file.path(run_dir, "output.txt")
  con <- NULL
  tryCatch({
    setwd(workspace)
    con <- file(primary, open = "wt", encoding = "UTF-8")
    sink(con)
    stage <- "caller"
    eval_user(user_code)
    stage <- "harness"
  }, error = fail, finally = {
    while (sink.number() > 0) sink()
    if (!is.null(con)) close(con)
  })
"#;

const LIST_BODY: &str = r#"
  primary <- file.path(run_dir, "packages.tsv")
  tryCatch({
    ip <- utils::installed.packages(lib.loc = .libPaths(), fields = "Title")
    rows <- ip[!duplicated(ip[, "Package"]), c("Package", "Version", "Title"), drop = FALSE]
    rows[is.na(rows)] <- ""
    rows[, "Title"] <- trimws(gsub("[[:space:]]+", " ", rows[, "Title"]))
    utils::write.table(rows, primary, sep = "\t", quote = FALSE,
                       row.names = FALSE, col.names = FALSE)
  }, error = fail)
"#;

const EXCEL_BODY: &str = r#"
  primary <- file.path(run_dir, "excel.tsv")
  tryCatch({
    setwd(workspace)
    stage <- "caller"
    path <- workspace_file(target)
    sheets <- readxl::excel_sheets(path)
    first <- readxl::read_excel(path, sheet = 1)
    flat <- function(x) gsub("[\t\r\n]", " ", as.character(x))
    lines <- c(paste0("sheet\t", flat(sheets)),
               paste0("rows\t", nrow(first)),
               paste0("columns\t", ncol(first)),
               paste0("column\t", flat(names(first))))
    writeLines(enc2utf8(lines), primary, useBytes = TRUE)
    stage <- "harness"
  }, error = fail)
"#;

/// Builds harness scripts for caller runs and package maintenance.
#[derive(Debug, Clone)]
pub struct ScriptBuilder {
    max_message_len: usize,
    preload: Vec<String>,
    repository: String,
}

impl ScriptBuilder {
    pub fn new(max_message_len: usize, preload: Vec<String>, repository: impl Into<String>) -> Self {
        Self {
            max_message_len,
            preload,
            repository: repository.into(),
        }
    }

    fn harness(&self, body: &str) -> String {
        let mut script = String::with_capacity(PRELUDE.len() + body.len() + EPILOGUE.len() + 64);
        script.push_str(PRELUDE);
        script.push_str(&format!("  max_message <- {}L\n", self.max_message_len.max(1)));
        script.push_str(body);
        script.push_str(EPILOGUE);
        script
    }

    /// Wrap a caller request.
    pub fn build(&self, request: &ExecutionRequest) -> WrappedScript {
        let (body, primary) = match request.output() {
            OutputKind::Text => (TEXT_BODY.to_string(), TEXT_OUTPUT_FILE.to_string()),
            OutputKind::Image(params) => (self.image_body(params), image_output_file(params.format)),
        };
        WrappedScript {
            harness: self.harness(&body),
            user_code: Some(request.code().to_string()),
            primary_output: Some(primary),
        }
    }

    fn image_body(&self, params: &ImageParams) -> String {
        let output = r_string(&image_output_file(params.format));
        let preload = if self.preload.is_empty() {
            String::new()
        } else {
            format!(
                "    for (pkg in {}) suppressPackageStartupMessages(library(pkg, character.only = TRUE))\n",
                r_vector(&self.preload)
            )
        };
        format!(
            r#"
  primary <- file.path(run_dir, {output})
  tryCatch({{
    setwd(workspace)
{preload}    {device}
    stage <- "caller"
    plotted <- eval_user(user_code)
    if (!plotted && "ggplot2" %in% loadedNamespaces()) {{
      last <- ggplot2::last_plot()
      if (!is.null(last)) print(last)
    }}
    stage <- "harness"
  }}, error = fail, finally = {{
    while (dev.cur() > 1) dev.off()
  }})
"#,
            output = output,
            preload = preload,
            device = device_call(params),
        )
    }

    /// Install `package` into the shared library from `repository`, or the
    /// configured one when `None`. The marker message carries the installed
    /// version on success.
    pub fn install_script(
        &self,
        package: &str,
        exact_version: Option<&str>,
        repository: Option<&str>,
    ) -> WrappedScript {
        let install = match exact_version {
            Some(version) => format!(
                r#"    if (!requireNamespace("remotes", quietly = TRUE)) {{
      utils::install.packages("remotes", lib = library_dir, quiet = TRUE)
    }}
    remotes::install_version(pkg, version = {version}, lib = library_dir,
                             upgrade = "never", quiet = TRUE, force = TRUE)
"#,
                version = r_string(version)
            ),
            None => "    utils::install.packages(pkg, lib = library_dir, quiet = TRUE)\n".to_string(),
        };

        let body = format!(
            r#"
  pkg <- {package}
  options(repos = c(CRAN = {repository}))
  warnings_seen <- character()
  tryCatch(withCallingHandlers({{
    if (!nzchar(library_dir)) stop("no package library configured")
    dir.create(library_dir, recursive = TRUE, showWarnings = FALSE)
    stage <- "caller"
{install}    if (!requireNamespace(pkg, lib.loc = library_dir, quietly = TRUE)) {{
      stop(paste0("package '", pkg, "' is not loadable after installation"))
    }}
    msg <- as.character(utils::packageVersion(pkg, lib.loc = library_dir))
    stage <- "harness"
  }}, warning = function(w) {{
    warnings_seen <<- c(warnings_seen, conditionMessage(w))
    invokeRestart("muffleWarning")
  }}), error = function(e) {{
    fail(e)
    if (length(warnings_seen) > 0) msg <<- paste(c(msg, warnings_seen), collapse = "\n")
  }})
"#,
            package = r_string(package),
            repository = r_string(repository.unwrap_or(&self.repository)),
            install = install,
        );

        WrappedScript {
            harness: self.harness(&body),
            user_code: None,
            primary_output: None,
        }
    }

    /// Read the sheet names and the first sheet's shape of workspace file
    /// `name` into `key\tvalue` lines.
    pub fn excel_details_script(&self, name: &str) -> WrappedScript {
        let body = format!("\n  target <- {}{}", r_string(name), EXCEL_BODY);
        WrappedScript {
            harness: self.harness(&body),
            user_code: None,
            primary_output: Some(EXCEL_DETAILS_FILE.to_string()),
        }
    }

    /// List every package visible on the library path as
    /// `name\tversion\ttitle` lines.
    pub fn list_packages_script(&self) -> WrappedScript {
        WrappedScript {
            harness: self.harness(LIST_BODY),
            user_code: None,
            primary_output: Some(PACKAGE_LIST_FILE.to_string()),
        }
    }
}

fn device_call(params: &ImageParams) -> String {
    let bitmap_type = r#"type = if (capabilities("cairo")) "cairo" else getOption("bitmapType")"#;
    let width_in = params.width as f64 / params.resolution as f64;
    let height_in = params.height as f64 / params.resolution as f64;
    match params.format {
        ImageFormat::Png => format!(
            r#"png(filename = primary, width = {}, height = {}, res = {}, units = "px", {})"#,
            params.width, params.height, params.resolution, bitmap_type
        ),
        ImageFormat::Jpeg => format!(
            r#"jpeg(filename = primary, width = {}, height = {}, res = {}, units = "px", quality = 95, {})"#,
            params.width, params.height, params.resolution, bitmap_type
        ),
        ImageFormat::Pdf => format!(
            "pdf(file = primary, width = {:.4}, height = {:.4})",
            width_in, height_in
        ),
        ImageFormat::Svg => format!(
            "svg(filename = primary, width = {:.4}, height = {:.4})",
            width_in, height_in
        ),
    }
}

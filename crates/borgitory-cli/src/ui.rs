use std::collections::VecDeque;
use std::io::Stdout;

use ratatui::Terminal;
use ratatui::layout::{Constraint, Direction, Layout, Rect};
use ratatui::prelude::{Color, CrosstermBackend, Modifier, Style};
use ratatui::widgets::{Cell, Paragraph, Row, Table};

use crate::terminal::TuiInputEvent;

const MAX_LOG_LINES: usize = 200;
const LOG_SHORTCUTS: &str = "Logs: Up/Down PgUp/PgDn Home/End | h = hide logs";

/// One row of the job table, rebuilt from a [`borgitory_core::JobSnapshot`]
/// each time the dashboard refreshes.
#[derive(Debug, Clone)]
pub(crate) struct JobRow {
    pub id: String,
    pub kind: String,
    pub status: String,
    pub task: String,
    pub detail: String,
}

pub(crate) struct Ui {
    terminal: Terminal<CrosstermBackend<Stdout>>,
    jobs: Vec<JobRow>,
    global_message: String,
    status_prefix: String,
    stop_message: String,
    logs: VecDeque<String>,
    logs_visible: bool,
    log_scroll_from_bottom: usize,
    log_viewport_height: usize,
}

impl Ui {
    pub(crate) fn new() -> anyhow::Result<Self> {
        let backend = CrosstermBackend::new(std::io::stdout());
        let terminal = Terminal::new(backend)?;

        let mut ui = Self {
            terminal,
            jobs: Vec::new(),
            global_message: "borgitory-demo".to_string(),
            status_prefix: String::new(),
            stop_message: String::new(),
            logs: VecDeque::new(),
            logs_visible: true,
            log_scroll_from_bottom: 0,
            log_viewport_height: 1,
        };
        ui.redraw();
        Ok(ui)
    }

    pub(crate) fn println(&mut self, msg: &str) {
        if self.logs.len() >= MAX_LOG_LINES {
            self.logs.pop_front();
            if self.log_scroll_from_bottom > 0 {
                self.log_scroll_from_bottom = self.log_scroll_from_bottom.saturating_sub(1);
            }
        }
        if self.log_scroll_from_bottom > 0 {
            self.log_scroll_from_bottom = self.log_scroll_from_bottom.saturating_add(1);
        }
        self.logs.push_back(msg.to_string());
        self.clamp_log_scroll();
        self.redraw();
    }

    pub(crate) fn handle_input(&mut self, event: TuiInputEvent) {
        match event {
            TuiInputEvent::ToggleLogPane => self.logs_visible = !self.logs_visible,
            TuiInputEvent::LogUp => self.scroll_logs_up(1),
            TuiInputEvent::LogDown => self.scroll_logs_down(1),
            TuiInputEvent::LogPageUp => self.scroll_logs_up(self.log_viewport_height.max(1)),
            TuiInputEvent::LogPageDown => self.scroll_logs_down(self.log_viewport_height.max(1)),
            TuiInputEvent::LogHome => self.log_scroll_from_bottom = self.max_log_scroll(),
            TuiInputEvent::LogEnd => self.log_scroll_from_bottom = 0,
        }
        self.clamp_log_scroll();
        self.redraw();
    }

    pub(crate) fn set_jobs(&mut self, jobs: Vec<JobRow>) {
        self.jobs = jobs;
        self.redraw();
    }

    pub(crate) fn set_stop_message(&mut self, msg: &str) {
        self.stop_message = msg.to_string();
        self.redraw();
    }

    pub(crate) fn set_status_prefix(&mut self, msg: &str) {
        self.status_prefix = msg.to_string();
        self.redraw();
    }

    pub(crate) fn tick_global(&mut self, msg: String) {
        self.global_message = msg;
        self.redraw();
    }

    pub(crate) fn freeze(&mut self) {
        self.redraw();
    }

    fn redraw(&mut self) {
        self.update_log_viewport_hint();
        self.clamp_log_scroll();

        let global_message = self.global_message.clone();
        let status_message = self.status_line();
        let logs_visible = self.logs_visible;
        let rows: Vec<Row> = self
            .jobs
            .iter()
            .map(|j| {
                Row::new(vec![
                    Cell::from(j.id.clone()),
                    Cell::from(j.kind.clone()),
                    Cell::from(j.status.clone()),
                    Cell::from(j.task.clone()),
                    Cell::from(j.detail.clone()),
                ])
            })
            .collect();
        let visible_logs = self.visible_logs();

        let _ = self.terminal.draw(|frame| {
            let (global_area, top_area, separator_area, log_area, stop_area) =
                compute_layout(frame.area(), logs_visible);
            let (top_content_area, top_footer_area) = split_pane_with_footer(top_area);
            let (log_content_area, log_footer_area) = split_pane_with_footer(log_area);

            let global = Paragraph::new(global_message.as_str())
                .style(Style::default().add_modifier(Modifier::BOLD));
            frame.render_widget(global, global_area);

            let header = Row::new(vec!["JOB", "KIND", "STATUS", "TASK", "DETAIL"])
                .style(Style::default().fg(Color::DarkGray));
            let table = Table::new(
                rows,
                [
                    Constraint::Length(8),
                    Constraint::Length(17),
                    Constraint::Length(10),
                    Constraint::Length(12),
                    Constraint::Min(0),
                ],
            )
            .header(header)
            .column_spacing(1);
            frame.render_widget(table, top_content_area);

            if logs_visible {
                let logs = Paragraph::new(visible_logs.join("\n"));
                frame.render_widget(logs, log_content_area);

                let separator = Paragraph::new("-".repeat(separator_area.width as usize))
                    .style(Style::default().fg(Color::DarkGray));
                frame.render_widget(separator, separator_area);
            }

            let top_shortcuts = if logs_visible {
                "h = hide logs"
            } else {
                "h = show logs"
            };
            frame.render_widget(
                Paragraph::new(top_shortcuts).style(Style::default().fg(Color::DarkGray)),
                top_footer_area,
            );
            if logs_visible {
                frame.render_widget(
                    Paragraph::new(LOG_SHORTCUTS).style(Style::default().fg(Color::DarkGray)),
                    log_footer_area,
                );
            }

            let status = Paragraph::new(status_message.as_str());
            frame.render_widget(status, stop_area);
        });
    }

    fn visible_logs(&self) -> Vec<String> {
        if self.logs.is_empty() || self.log_viewport_height == 0 {
            return Vec::new();
        }
        let viewport = self.log_viewport_height;
        let len = self.logs.len();
        let start = len.saturating_sub(viewport + self.log_scroll_from_bottom);
        let end = (start + viewport).min(len);
        self.logs
            .iter()
            .skip(start)
            .take(end.saturating_sub(start))
            .cloned()
            .collect()
    }

    fn scroll_logs_up(&mut self, lines: usize) {
        let max_scroll = self.max_log_scroll();
        self.log_scroll_from_bottom = self
            .log_scroll_from_bottom
            .saturating_add(lines)
            .min(max_scroll);
    }

    fn scroll_logs_down(&mut self, lines: usize) {
        self.log_scroll_from_bottom = self.log_scroll_from_bottom.saturating_sub(lines);
    }

    fn max_log_scroll(&self) -> usize {
        self.logs
            .len()
            .saturating_sub(self.log_viewport_height.max(1))
    }

    fn clamp_log_scroll(&mut self) {
        self.log_scroll_from_bottom = self.log_scroll_from_bottom.min(self.max_log_scroll());
    }

    fn update_log_viewport_hint(&mut self) {
        if let Ok(area) = self.terminal.size() {
            let area = Rect::new(0, 0, area.width, area.height);
            let (_, _, _, log_area, _) = compute_layout(area, self.logs_visible);
            let (log_content_area, _) = split_pane_with_footer(log_area);
            self.log_viewport_height = log_content_area.height as usize;
        }
    }

    fn status_line(&self) -> String {
        let prefix = self.status_prefix.trim();
        let stop = self.stop_message.trim();
        if prefix.is_empty() && stop.is_empty() {
            return " ".to_string();
        }
        if stop.is_empty() {
            return prefix.to_string();
        }
        if prefix.is_empty() {
            return stop.to_string();
        }
        format!("{prefix} | {stop}")
    }
}

fn split_pane_with_footer(area: Rect) -> (Rect, Rect) {
    if area.height == 0 {
        return (area, area);
    }
    let split = Layout::default()
        .direction(Direction::Vertical)
        .constraints([Constraint::Min(0), Constraint::Length(1)])
        .split(area);
    (split[0], split[1])
}

fn compute_layout(area: Rect, logs_visible: bool) -> (Rect, Rect, Rect, Rect, Rect) {
    let outer = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(1),
            Constraint::Min(1),
            Constraint::Length(1),
        ])
        .split(area);
    if !logs_visible {
        let empty = Rect::new(outer[1].x, outer[1].y, 0, 0);
        return (outer[0], outer[1], empty, empty, outer[2]);
    }
    let middle = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Ratio(1, 2),
            Constraint::Length(1),
            Constraint::Ratio(1, 2),
        ])
        .split(outer[1]);
    (outer[0], middle[0], middle[1], middle[2], outer[2])
}

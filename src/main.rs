use iced::{
    widget::{button, column, container, row, scrollable, text, text_input, Column, Row, text_input::Id},
    Element, Length, Task, Theme, Font, Subscription,
    time,
    keyboard::{self, Key},
    event::{self, Event as IcedEvent},
    alignment,
    window,
};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

use ragbar::conversation::Message as ChatMessage;
use ragbar::{
    Config, DispatchError, EndpointResolver, FileEndpointStore, HttpBackend, Reply, Sender,
    SessionController, SessionMode, TurnId,
};

const SPINNER_FRAMES: [&str; 10] = ["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"];

fn init_logging() {
    let filter = EnvFilter::try_from_env("RAGBAR_LOG").unwrap_or_else(|_| EnvFilter::new("ragbar=info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn main() -> iced::Result {
    init_logging();
    let config = Config::load();
    let size = iced::Size::new(config.window.width as f32, config.window.height as f32);
    let min_size = iced::Size::new(config.window.min_width as f32, config.window.min_height as f32);

    iced::application("ragbar", App::update, App::view)
        .theme(App::theme)
        .subscription(App::subscription)
        .window(window::Settings {
            size,
            min_size: Some(min_size),
            position: window::Position::Centered,
            ..Default::default()
        })
        .default_font(Font::MONOSPACE)
        .run_with(move || App::new(config))
}

#[derive(Debug, Clone)]
enum Message {
    InputChanged(String),
    Submit,
    TurnFinished(TurnId, Result<Reply, DispatchError>),
    ModeSelected(SessionMode),
    EndpointChanged(String),
    SaveEndpoint,
    ClearStatus,
    Tick,
    Exit,
}

struct Status {
    text: &'static str,
    is_error: bool,
}

struct App {
    session: SessionController<HttpBackend>,
    resolver: EndpointResolver<FileEndpointStore>,
    input_text: String,
    endpoint_text: String,
    status: Option<Status>,
    loading_frame: usize,
    input_id: Id,
    scroll_id: scrollable::Id,
}

impl App {
    fn new(config: Config) -> (Self, Task<Message>) {
        let backend = HttpBackend::new(config.backend.timeout(), config.backend.search_k);
        let resolver = EndpointResolver::with_fallback(
            FileEndpointStore::in_config_dir(),
            config.backend.default_endpoint.clone(),
        );
        let base = resolver.current();
        tracing::info!("Using API base {}", base);

        let input_id = Id::unique();
        let app = App {
            session: SessionController::new(Arc::new(backend), base.clone(), config.backend.default_mode),
            resolver,
            input_text: String::new(),
            endpoint_text: base.to_string(),
            status: None,
            loading_frame: 0,
            input_id: input_id.clone(),
            scroll_id: scrollable::Id::unique(),
        };

        (app, text_input::focus(input_id))
    }

    fn snap_to_latest(&self) -> Task<Message> {
        scrollable::snap_to(self.scroll_id.clone(), scrollable::RelativeOffset::END)
    }

    fn update(&mut self, message: Message) -> Task<Message> {
        match message {
            Message::InputChanged(value) => {
                self.input_text = value;
                Task::none()
            }
            Message::Submit => {
                let Some(turn) = self.session.begin_turn(&self.input_text) else {
                    return Task::none();
                };
                self.input_text.clear();
                self.loading_frame = 0;

                let backend = self.session.backend();
                let dispatch = Task::future(async move {
                    let outcome = turn.request.dispatch(backend.as_ref()).await;
                    Message::TurnFinished(turn.id, outcome)
                });

                Task::batch([dispatch, self.snap_to_latest()])
            }
            Message::TurnFinished(id, outcome) => {
                self.session.finish_turn(id, outcome);
                Task::batch([self.snap_to_latest(), text_input::focus(self.input_id.clone())])
            }
            Message::ModeSelected(mode) => {
                self.session.set_mode(mode);
                Task::none()
            }
            Message::EndpointChanged(value) => {
                self.endpoint_text = value;
                Task::none()
            }
            Message::SaveEndpoint => {
                match self.resolver.resolve(&self.endpoint_text) {
                    Ok(url) => {
                        self.session.set_endpoint(url);
                        self.endpoint_text = self.session.endpoint().to_string();
                        self.status = Some(Status {
                            text: "API base saved.",
                            is_error: false,
                        });
                        Task::perform(tokio::time::sleep(Duration::from_millis(1200)), |_| Message::ClearStatus)
                    }
                    Err(e) => {
                        tracing::debug!("{}", e);
                        self.status = Some(Status {
                            text: "Invalid URL for API base.",
                            is_error: true,
                        });
                        Task::none()
                    }
                }
            }
            Message::ClearStatus => {
                if matches!(self.status, Some(Status { is_error: false, .. })) {
                    self.status = None;
                }
                Task::none()
            }
            Message::Tick => {
                if self.session.is_busy() {
                    self.loading_frame = (self.loading_frame + 1) % SPINNER_FRAMES.len();
                }
                Task::none()
            }
            Message::Exit => {
                iced::exit()
            }
        }
    }

    fn subscription(&self) -> Subscription<Message> {
        let timer = if self.session.is_busy() {
            time::every(Duration::from_millis(80)).map(|_| Message::Tick)
        } else {
            Subscription::none()
        };

        let events = event::listen_with(|event, _status, _id| {
            if let IcedEvent::Keyboard(keyboard::Event::KeyPressed {
                key: Key::Named(keyboard::key::Named::Escape),
                ..
            }) = event
            {
                Some(Message::Exit)
            } else {
                None
            }
        });

        Subscription::batch([timer, events])
    }

    fn view(&self) -> Element<Message> {
        let busy = self.session.is_busy();

        let endpoint = row![
            text_input("http://localhost:8000", &self.endpoint_text)
                .on_input(Message::EndpointChanged)
                .on_submit(Message::SaveEndpoint)
                .padding(8)
                .size(14),
            button(text("Save").size(14))
                .on_press(Message::SaveEndpoint)
                .padding(8),
        ]
        .spacing(8);

        let current_mode = self.session.mode();
        let modes = SessionMode::ALL.iter().fold(Row::new().spacing(6), |modes, &mode| {
            let label = if mode == current_mode {
                format!("[{}]", mode.label())
            } else {
                mode.label().to_string()
            };
            modes.push(
                button(text(label).size(13))
                    .on_press(Message::ModeSelected(mode))
                    .padding(6),
            )
        });

        let mut messages = Column::new().spacing(12);
        for message in self.session.messages() {
            messages = messages.push(message_bubble(message));
        }
        if busy {
            messages = messages.push(text(SPINNER_FRAMES[self.loading_frame]).size(20));
        }

        let history = scrollable(
            container(messages)
                .padding(15)
                .width(Length::Fill)
        )
        .id(self.scroll_id.clone())
        .height(Length::Fill);

        let mut input = text_input("Type your message here...", &self.input_text)
            .padding(15)
            .size(18)
            .id(self.input_id.clone());
        if !busy {
            input = input
                .on_input(Message::InputChanged)
                .on_submit(Message::Submit);
        }

        let can_send = !busy && !self.input_text.trim().is_empty();
        let send = button(text(if busy { "⏳" } else { "➤" }).size(18))
            .on_press_maybe(can_send.then_some(Message::Submit))
            .padding(15);

        let mut content_column = column![endpoint, modes]
            .spacing(10)
            .padding(10);

        if let Some(status) = &self.status {
            let marker = if status.is_error { "✗" } else { "✓" };
            content_column = content_column.push(text(format!("{} {}", marker, status.text)).size(13));
        }

        content_column = content_column
            .push(history)
            .push(row![input, send].spacing(8));

        container(content_column)
            .width(Length::Fill)
            .height(Length::Fill)
            .into()
    }

    fn theme(&self) -> Theme {
        Theme::TokyoNight
    }
}

fn message_bubble(message: &ChatMessage) -> Element<'static, Message> {
    let (who, align) = match message.sender {
        Sender::User => ("You", alignment::Horizontal::Right),
        Sender::Bot => ("Bot", alignment::Horizontal::Left),
    };

    container(
        column![
            text(format!("{} · {}", who, message.timestamp.format("%H:%M"))).size(12),
            text(message.text.clone()).size(15),
        ]
        .spacing(4)
    )
    .width(Length::Fill)
    .align_x(align)
    .into()
}

use iced::{
    widget::{button, column, container, row, scrollable, text, text_input, text_input::Id},
    Element, Length, Task, Theme, Font, Subscription,
    time, clipboard,
    keyboard::{self, Key},
    event::{self, Event as IcedEvent},
    alignment,
    window,
};
use std::time::Duration;

use physics_bar::bridge::{Bridge, BridgeEvent, Ticket};
use physics_bar::config::Config;
use physics_bar::logging;

fn main() -> iced::Result {
    logging::init("info");
    let config = Config::load();
    let window_size = iced::Size::new(config.window.width as f32, config.window.height as f32);

    iced::application("Physics Solver", App::update, App::view)
        .theme(App::theme)
        .subscription(App::subscription)
        .window(window::Settings {
            size: window_size,
            position: window::Position::Centered,
            ..Default::default()
        })
        .run_with(move || App::new(config))
}

#[derive(Debug, Clone)]
enum Message {
    InputChanged(String),
    Submit,
    Tick,
    CopyCCode,
    CopyManimCode,
    Exit,
}

struct App {
    input_text: String,
    solution: String,
    c_code: String,
    manim_code: String,
    status: String,
    pending: Option<Ticket>,
    loading_frame: usize,
    bridge: Bridge,
    input_id: Id,
}

impl App {
    fn new(config: Config) -> (Self, Task<Message>) {
        let mut bridge = Bridge::new();
        let status = match bridge.start(config.host.to_command()) {
            Ok(()) => "Connecting to tool host...".to_string(),
            Err(e) => {
                tracing::error!("Failed to start bridge thread: {}", e);
                format!("Failed to start: {}", e)
            }
        };

        let input_id = Id::unique();
        let app = App {
            input_text: String::new(),
            solution: String::new(),
            c_code: String::new(),
            manim_code: String::new(),
            status,
            pending: None,
            loading_frame: 0,
            bridge,
            input_id: input_id.clone(),
        };

        (app, text_input::focus(input_id))
    }

    /// Errors replace the solution and clear the code panes.
    fn show_error(&mut self, error: &str) {
        self.solution = format!("Error: {}", error);
        self.c_code.clear();
        self.manim_code.clear();
    }

    fn apply(&mut self, event: BridgeEvent) {
        match event {
            BridgeEvent::Connected { tools } => {
                self.status = format!("Connected to tool host ({} tools)", tools.len());
            }
            BridgeEvent::Solved { ticket, result } => {
                if self.pending == Some(ticket) {
                    self.pending = None;
                }
                match result {
                    Ok(segments) => {
                        self.solution = segments.solution;
                        self.c_code = segments.c_code;
                        self.manim_code = segments.manim_code;
                        self.status = "Done".to_string();
                    }
                    Err(e) => {
                        self.show_error(&e);
                        self.status = "Request failed".to_string();
                    }
                }
            }
            BridgeEvent::Disconnected { reason } => {
                if self.pending.take().is_some() {
                    self.show_error(&reason);
                }
                self.status = format!("Disconnected: {}", reason);
            }
        }
    }

    fn update(&mut self, message: Message) -> Task<Message> {
        match message {
            Message::InputChanged(value) => {
                self.input_text = value;
                Task::none()
            }
            Message::Submit => {
                let question = self.input_text.trim().to_string();
                if question.is_empty() || self.pending.is_some() {
                    return Task::none();
                }

                match self.bridge.submit(question) {
                    Ok(ticket) => {
                        tracing::info!(ticket, "Question submitted");
                        self.pending = Some(ticket);
                        self.status = "Solving...".to_string();
                    }
                    Err(e) => self.show_error(&e.to_string()),
                }
                Task::none()
            }
            Message::Tick => {
                if self.pending.is_some() {
                    self.loading_frame = (self.loading_frame + 1) % 10;
                }
                for event in self.bridge.poll_events() {
                    self.apply(event);
                }
                Task::none()
            }
            Message::CopyCCode => clipboard::write(self.c_code.clone()),
            Message::CopyManimCode => clipboard::write(self.manim_code.clone()),
            Message::Exit => {
                self.bridge.shutdown();
                iced::exit()
            }
        }
    }

    fn subscription(&self) -> Subscription<Message> {
        let timer = time::every(Duration::from_millis(100)).map(|_| Message::Tick);

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
        let input = text_input("Describe a physics problem...", &self.input_text)
            .on_input(Message::InputChanged)
            .on_submit(Message::Submit)
            .padding(12)
            .size(16)
            .id(self.input_id.clone());

        let solve = button(text("Solve").size(16))
            .on_press_maybe(self.pending.is_none().then_some(Message::Submit))
            .padding(12);

        let status = if self.pending.is_some() {
            let frames = ["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"];
            format!("{} {}", frames[self.loading_frame % frames.len()], self.status)
        } else {
            self.status.clone()
        };

        let left = column![
            pane("Solution", &self.solution, None),
            pane("Generated C Code", &self.c_code, Some(Message::CopyCCode)),
        ]
        .spacing(10)
        .width(Length::FillPortion(1));

        let right = container(pane("Manim Visualization", &self.manim_code, Some(Message::CopyManimCode)))
            .width(Length::FillPortion(1))
            .height(Length::Fill);

        let content = column![
            row![input, solve].spacing(10).align_y(alignment::Vertical::Center),
            text(status).size(13),
            row![left, right].spacing(10).height(Length::Fill),
        ]
        .spacing(10)
        .padding(10);

        container(content)
            .width(Length::Fill)
            .height(Length::Fill)
            .into()
    }

    fn theme(&self) -> Theme {
        Theme::TokyoNight
    }
}

fn pane<'a>(title: &'a str, body: &'a str, copy: Option<Message>) -> Element<'a, Message> {
    let mut header = row![text(title).size(15)].spacing(10).align_y(alignment::Vertical::Center);
    if let Some(message) = copy {
        if !body.is_empty() {
            header = header.push(button(text("[Copy]").size(12)).on_press(message).padding(4));
        }
    }

    column![
        header,
        scrollable(
            container(text(body).size(14).font(Font::MONOSPACE))
                .padding(10)
                .width(Length::Fill)
        )
        .height(Length::Fill),
    ]
    .spacing(6)
    .height(Length::Fill)
    .into()
}
